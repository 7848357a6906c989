use std::error::Error;

use secrecy::SecretString;
use slack_sdk::web_api::{MsgOption, PermalinkParameters, WebApiClient};

fn main() -> Result<(), Box<dyn Error>> {
    let bot_token = "REPLACE_WITH_BOT_TOKEN".to_string();
    let channel = "REPLACE_WITH_CHANNEL_ID".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let api = WebApiClient::new(SecretString::new(bot_token))?;

        let posted = api
            .post_message(
                &channel,
                &[
                    MsgOption::text("Deploy finished <with details>", true),
                    MsgOption::LinkNames(true),
                ],
            )
            .await?;

        let permalink = api
            .get_permalink(&PermalinkParameters {
                channel: posted.channel.clone(),
                ts: posted.ts.clone(),
            })
            .await?;
        println!("channel={} ts={} permalink={permalink}", posted.channel, posted.ts);

        api.update_message(
            &posted.channel,
            &posted.ts,
            &[MsgOption::text("Deploy finished (edited)", false)],
        )
        .await?;

        Ok::<(), Box<dyn Error>>(())
    })
}
