//! `membase add|get|conversations|delete|clear`: direct store access.

use membase_config::AppConfig;
use membase_core::message::{Message, Role, Tier};
use membase_core::wire;

use super::{Mode, open};

pub async fn add(
    config: &AppConfig,
    conversation: &str,
    text: String,
    role: Role,
    name: Option<String>,
    tier: Tier,
) -> Result<(), Box<dyn std::error::Error>> {
    let manager = open(config, Mode::Local).await?;
    let name = name.unwrap_or_else(|| config.account.clone());
    let message = Message::new(name, role, text).with_tier(tier);

    let result = manager.add_to(conversation, message).await;
    manager.close().await;
    let committed = result?;

    println!(
        "Stored {} #{} in {conversation} (id {})",
        tier,
        committed.memory_index().unwrap_or_default(),
        committed.id
    );
    Ok(())
}

pub async fn get(
    config: &AppConfig,
    conversation: &str,
    tier: Tier,
    recent: Option<usize>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let manager = open(config, Mode::Local).await?;
    let result = manager.store().get(conversation, tier, recent).await;
    manager.close().await;
    let messages = result?;

    if json {
        println!("{}", wire::encode_all(&messages)?);
        return Ok(());
    }
    if messages.is_empty() {
        println!("No {tier} messages in {conversation}.");
        return Ok(());
    }
    for message in &messages {
        println!(
            "{:>4}  [{}] {}",
            message.memory_index().unwrap_or_default(),
            message.timestamp,
            message.formatted()
        );
    }
    Ok(())
}

pub async fn conversations(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let manager = open(config, Mode::Local).await?;
    let mut rows = Vec::new();
    let result = async {
        for id in manager.conversations().await? {
            let mut counts = Vec::with_capacity(Tier::ALL.len());
            for tier in Tier::ALL {
                counts.push(manager.size(Some(id.as_str()), tier).await?);
            }
            rows.push((id, counts));
        }
        Ok::<_, membase_core::Error>(())
    }
    .await;
    manager.close().await;
    result?;

    if rows.is_empty() {
        println!("No conversations for {}.", config.account);
        return Ok(());
    }
    println!("{:<40} {:>6} {:>6} {:>8}", "conversation", "stm", "ltm", "profile");
    for (id, counts) in rows {
        println!("{id:<40} {:>6} {:>6} {:>8}", counts[0], counts[1], counts[2]);
    }
    Ok(())
}

pub async fn delete(
    config: &AppConfig,
    conversation: &str,
    tier: Tier,
    indices: &[u64],
) -> Result<(), Box<dyn std::error::Error>> {
    let manager = open(config, Mode::Local).await?;
    let result = manager.delete(Some(conversation), tier, indices).await;
    manager.close().await;
    println!("Deleted {} {tier} message(s) from {conversation}", result?);
    Ok(())
}

pub async fn clear(
    config: &AppConfig,
    conversation: &str,
    tier: Option<Tier>,
    confirm: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let scope = tier.map_or("every tier".to_string(), |t| format!("the {t} tier"));
    if !confirm {
        println!("This permanently deletes {scope} of {conversation}.");
        println!("Run again with --confirm to proceed.");
        return Ok(());
    }

    let manager = open(config, Mode::Local).await?;
    let result = manager.clear(Some(conversation), tier).await;
    manager.close().await;
    println!("Removed {} message(s) from {scope} of {conversation}", result?);
    Ok(())
}
