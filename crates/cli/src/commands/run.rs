//! `membase run`: background consolidation and mirroring.

use membase_config::AppConfig;
use tracing::info;

use super::{Mode, open};

pub async fn run(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let manager = open(config, Mode::Background).await?;

    println!("Membase running for {}", config.account);
    println!(
        "   Consolidation: {}",
        if manager.is_consolidating().await {
            format!("every {}s", config.consolidation.tick_interval_secs)
        } else {
            "off".to_string()
        }
    );
    println!(
        "   Mirroring:     {}",
        if manager.store().sync_queue().is_some() {
            config.hub.url.as_str()
        } else {
            "off"
        }
    );
    println!("   Press Ctrl-C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    manager.close().await;

    if let Some(queue) = manager.store().sync_queue() {
        let stats = queue.stats();
        println!("Uploaded {}, failed {}", stats.uploaded, stats.failed);
    }
    Ok(())
}
