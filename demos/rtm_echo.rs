use std::error::Error;

use secrecy::SecretString;
use slack_sdk::gateway::{ApplicationEvent, Gateway, GatewayConfig, OutgoingMessage};
use slack_sdk::web_api::WebApiClient;

fn main() -> Result<(), Box<dyn Error>> {
    let bot_token = "REPLACE_WITH_BOT_TOKEN".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let api = WebApiClient::new(SecretString::new(bot_token))?;
        let me = api.auth_test().await?;
        let (gateway, mut events) = Gateway::new(api, GatewayConfig::rtm());
        gateway.start()?;

        while let Ok(event) = events.recv().await {
            let ApplicationEvent::Rtm { kind, body } = event.event() else {
                continue;
            };
            if kind != "message" || body["user"].as_str() == Some(me.user_id.as_str()) {
                continue;
            }

            let channel = body["channel"].as_str().unwrap_or_default();
            let text = body["text"].as_str().unwrap_or_default();
            let mut reply = OutgoingMessage::new(channel, format!("echo: {text}"));
            if let Some(thread_ts) = body["thread_ts"].as_str() {
                reply = reply.in_thread(thread_ts);
            }

            let pending = gateway.send_outgoing(&reply)?;
            match pending.wait().await {
                Ok(ack) => println!("sent ts={}", ack["ts"]),
                Err(err) => eprintln!("send {} failed: {err}", reply.channel),
            }
        }

        gateway.stop().await;
        Ok::<(), Box<dyn Error>>(())
    })
}
