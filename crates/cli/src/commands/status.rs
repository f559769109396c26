//! `membase status`: configuration and store counts.

use membase_config::AppConfig;
use membase_core::message::Tier;
use membase_core::profile_conversation_id;

use super::{Mode, open};

pub async fn run(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("Membase Status");
    println!("==============");
    println!("  Account:      {}", config.account);
    println!("  Config dir:   {}", AppConfig::config_dir().display());
    println!("  Storage:      {}", config.storage.backend);
    if config.storage.backend == "sqlite" {
        println!(
            "  Database:     {}",
            config.storage.database_path(&config.account).display()
        );
    }
    println!("  Hub:          {}", config.hub.url);
    println!(
        "  Hub id:       {}",
        config.hub.hub_id.as_deref().unwrap_or("(account)")
    );
    println!(
        "  Auto-upload:  {}",
        if config.hub.auto_upload { "enabled" } else { "disabled" }
    );
    println!(
        "  Consolidation: {} (batch {}, every {}s, {:?} trigger)",
        if config.consolidation.enabled { "enabled" } else { "disabled" },
        config.consolidation.batch_size,
        config.consolidation.tick_interval_secs,
        config.consolidation.trigger
    );
    println!(
        "  Summarizer:   {} / {}",
        config.summarizer.provider, config.summarizer.model
    );

    let manager = open(config, Mode::Local).await?;
    let counts = async {
        let conversations = manager.conversations().await?;
        let profile = manager
            .size(Some(profile_conversation_id(&config.account).as_str()), Tier::Profile)
            .await?;
        let pending = manager.store().pending_uploads(usize::MAX).await?.len();
        Ok::<_, membase_core::Error>((conversations.len(), profile, pending))
    }
    .await;
    manager.close().await;
    let (conversations, profile, pending) = counts?;

    println!();
    println!("  Conversations:    {conversations}");
    println!("  Profile entries:  {profile}");
    println!("  Pending uploads:  {pending}");

    let config_path = AppConfig::config_dir().join("config.toml");
    if !config_path.exists() {
        println!("\n  No config file, run `membase init` first");
    }
    Ok(())
}
