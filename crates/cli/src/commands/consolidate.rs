//! `membase consolidate`: one cycle, in the foreground.

use membase_config::AppConfig;

use super::{Mode, open};

pub async fn run(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let manager = open(config, Mode::Summarize).await?;
    let report = manager.consolidate_now().await;
    manager.close().await;

    let Some(report) = report else {
        println!("No summarizer configured (summarizer.provider = \"none\").");
        return Ok(());
    };
    println!("Scanned {} conversation(s)", report.scanned);
    println!("  LTM written:       {}", report.ltm_written);
    println!("  Profiles written:  {}", report.profiles_written);
    println!("  Incomplete:        {}", report.incomplete);
    println!("  Failures:          {}", report.failures);
    if report.failures > 0 {
        println!("Failed batches are retried on the next run.");
    }
    Ok(())
}
