use std::error::Error;

use secrecy::SecretString;
use slack_sdk::gateway::{ApplicationEvent, Gateway, GatewayConfig};
use slack_sdk::web_api::{MsgOption, WebApiClient};

fn main() -> Result<(), Box<dyn Error>> {
    let bot_token = "REPLACE_WITH_BOT_TOKEN".to_string();
    let app_token = "REPLACE_WITH_APP_TOKEN".to_string();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let api = WebApiClient::new(SecretString::new(bot_token))?
            .with_app_token(SecretString::new(app_token));
        let (gateway, mut events) = Gateway::new(api.clone(), GatewayConfig::socket_mode());
        gateway.start()?;

        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(err) => {
                    eprintln!("gateway closed: {err}");
                    break;
                }
            };

            match event.event() {
                ApplicationEvent::EventsApi(payload) => {
                    event.acknowledge().await?;
                    if payload.inner_type() == Some("app_mention") {
                        let channel = payload.event["channel"].as_str().unwrap_or_default();
                        let ts = payload.event["ts"].as_str().unwrap_or_default();
                        api.post_message(
                            channel,
                            &[
                                MsgOption::text("Yes, hello.", false),
                                MsgOption::ThreadTs(ts.to_string()),
                            ],
                        )
                        .await?;
                    }
                }
                ApplicationEvent::SlashCommand(command) => {
                    println!("slash command {} from {}", command.command, command.user_id);
                    event
                        .acknowledge_with(serde_json::json!({"text": "Working on it."}))
                        .await?;
                }
                ApplicationEvent::Interactive(_) => {
                    event.acknowledge().await?;
                }
                other => {
                    println!("ignored event kind={}", other.kind());
                    event.acknowledge().await?;
                }
            }
        }

        gateway.stop().await;
        Ok::<(), Box<dyn Error>>(())
    })
}
