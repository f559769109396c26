//! `membase pull`: load hub conversations into local storage.

use membase_config::AppConfig;

use super::{Mode, open};

pub async fn run(
    config: &AppConfig,
    conversation: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let manager = open(config, Mode::Local).await?;
    let result = match conversation {
        Some(id) => manager.load_from_hub(id).await,
        None => manager.load_all_from_hub().await,
    };
    manager.close().await;

    println!(
        "Loaded {} message(s) for {} from {}",
        result?, config.account, config.hub.url
    );
    Ok(())
}
