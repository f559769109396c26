//! `membase init`: first-time setup.

use membase_config::AppConfig;
use std::path::Path;

pub fn run(path: Option<&Path>, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"));

    if let Some(dir) = config_path.parent()
        && !dir.as_os_str().is_empty()
    {
        std::fs::create_dir_all(dir)?;
    }

    if config_path.exists() && !force {
        println!("Config already exists: {}", config_path.display());
        println!("Run with --force to overwrite it.");
    } else {
        std::fs::write(&config_path, AppConfig::default_toml())?;
        println!("Wrote {}", config_path.display());
    }

    let config = AppConfig::load_from(&config_path)?;
    let data_root = config.storage.data_root();
    std::fs::create_dir_all(&data_root)?;
    println!("Data directory: {}", data_root.display());
    println!();
    println!("Next steps:");
    println!("  export MEMBASE_ACCOUNT=<your account>");
    println!("  export MEMBASE_API_KEY=<key for the summarizer model>");
    println!("  membase add -c chat-1 \"hello\"");
    Ok(())
}
