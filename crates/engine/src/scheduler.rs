//! Consolidation scheduler: turns full STM batches into LTM and profile entries.
//!
//! Nothing records which batches were consumed. Each cycle rebuilds the
//! cursor from the highest STM and LTM indices of a conversation, so a
//! batch whose LTM entry is committed is never picked again, and a batch
//! whose summarization failed is picked again on the next tick.

use membase_config::TriggerRule;
use membase_core::error::StoreError;
use membase_core::message::{Message, Tier};
use membase_core::summarizer::Summarizer;
use membase_core::{is_derived_conversation, profile_conversation_id};
use membase_memory::MessageStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Inclusive STM index window consumed by one consolidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchWindow {
    pub start: u64,
    pub end: u64,
}

/// Decide whether a batch is due and which STM indices it covers.
///
/// `latest_stm` and `last_ltm` are the highest committed indices, `None`
/// for an empty tier.
pub fn due_batch(
    latest_stm: Option<u64>,
    last_ltm: Option<u64>,
    batch_size: u64,
    rule: TriggerRule,
) -> Option<BatchWindow> {
    if batch_size == 0 {
        return None;
    }
    let size = batch_size as i64;
    let latest = latest_stm.map_or(-1, |i| i as i64);
    let consumed = last_ltm.map_or(0, |i| i as i64 + 1);

    let available = match rule {
        TriggerRule::CompleteBatch => (latest + 1).div_euclid(size),
        TriggerRule::Legacy => latest.div_euclid(size),
    };
    if available <= consumed {
        return None;
    }

    let start = consumed as u64 * batch_size;
    Some(BatchWindow {
        start,
        end: start + batch_size - 1,
    })
}

/// What one cycle did, summed over conversations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Source conversations looked at
    pub scanned: usize,
    pub ltm_written: usize,
    pub profiles_written: usize,
    /// Due batches that were not fully readable yet
    pub incomplete: usize,
    /// Summarizer or store failures
    pub failures: usize,
}

enum Outcome {
    NotDue,
    Incomplete,
    Consolidated { profile: bool },
    Failed,
}

/// Drives the store and the summarizer for one account.
pub struct ConsolidationScheduler {
    store: Arc<MessageStore>,
    summarizer: Arc<dyn Summarizer>,
    profile_conversation_id: String,
    batch_size: u64,
    trigger: TriggerRule,
    /// Serializes cycles between the loop and manual runs
    cycle: Mutex<()>,
}

impl ConsolidationScheduler {
    pub fn new(store: Arc<MessageStore>, summarizer: Arc<dyn Summarizer>, batch_size: u64) -> Self {
        let profile_conversation_id = profile_conversation_id(store.account());
        Self {
            store,
            summarizer,
            profile_conversation_id,
            batch_size: batch_size.max(1),
            trigger: TriggerRule::default(),
            cycle: Mutex::new(()),
        }
    }

    pub fn with_trigger(mut self, trigger: TriggerRule) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn profile_conversation_id(&self) -> &str {
        &self.profile_conversation_id
    }

    pub fn batch_size(&self) -> u64 {
        self.batch_size
    }

    /// Run one tick over every source conversation.
    ///
    /// At most one batch per conversation is consolidated per call.
    pub async fn run_cycle(&self) -> CycleReport {
        let _cycle = self.cycle.lock().await;
        let mut report = CycleReport::default();

        let conversations = match self.store.list_conversations().await {
            Ok(ids) => ids,
            Err(e) => {
                error!(account = self.store.account(), error = %e, "Cannot list conversations");
                report.failures += 1;
                return report;
            }
        };

        for conversation_id in conversations
            .iter()
            .filter(|id| !is_derived_conversation(id))
        {
            report.scanned += 1;
            match self.consolidate(conversation_id).await {
                Ok(Outcome::NotDue) => {}
                Ok(Outcome::Incomplete) => report.incomplete += 1,
                Ok(Outcome::Consolidated { profile }) => {
                    report.ltm_written += 1;
                    if profile {
                        report.profiles_written += 1;
                    } else {
                        report.failures += 1;
                    }
                }
                Ok(Outcome::Failed) => report.failures += 1,
                Err(e) => {
                    error!(conversation_id = %conversation_id, error = %e, "Consolidation aborted");
                    report.failures += 1;
                }
            }
        }

        if report.ltm_written > 0 || report.failures > 0 {
            info!(
                account = self.store.account(),
                scanned = report.scanned,
                ltm = report.ltm_written,
                profiles = report.profiles_written,
                failures = report.failures,
                "Consolidation cycle finished"
            );
        }
        report
    }

    async fn consolidate(&self, conversation_id: &str) -> Result<Outcome, StoreError> {
        let latest_stm = self.store.last_index(conversation_id, Tier::Stm).await?;
        let last_ltm = self.store.last_index(conversation_id, Tier::Ltm).await?;
        let Some(window) = due_batch(latest_stm, last_ltm, self.batch_size, self.trigger) else {
            return Ok(Outcome::NotDue);
        };

        let batch = self
            .store
            .get_range(conversation_id, Tier::Stm, window.start, window.end)
            .await?;
        if (batch.len() as u64) < self.batch_size {
            debug!(
                conversation_id,
                start = window.start,
                found = batch.len(),
                "Batch not complete yet"
            );
            return Ok(Outcome::Incomplete);
        }

        let previous_ltm = last(self.store.get(conversation_id, Tier::Ltm, Some(1)).await?);
        let mut ltm = match self
            .summarizer
            .summarize_ltm(&batch, previous_ltm.as_ref())
            .await
        {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    conversation_id,
                    start = window.start,
                    error = %e,
                    "LTM summarization failed"
                );
                return Ok(Outcome::Failed);
            }
        };
        ltm.metadata
            .insert("source_range", serde_json::json!([window.start, window.end]))?;
        let ltm = self.store.add(conversation_id, Tier::Ltm, ltm).await?;
        debug!(
            conversation_id,
            memory_index = ltm.memory_index(),
            "LTM entry written"
        );

        let profile_id = self.profile_conversation_id.as_str();
        let previous_profile = last(self.store.get(profile_id, Tier::Profile, Some(1)).await?);
        let profile = match self
            .summarizer
            .summarize_profile(&batch, previous_profile.as_ref())
            .await
        {
            Ok(message) => message,
            Err(e) => {
                // The LTM entry stays; this profile update is skipped for good.
                warn!(conversation_id, error = %e, "Profile summarization failed");
                return Ok(Outcome::Consolidated { profile: false });
            }
        };
        self.store.add(profile_id, Tier::Profile, profile).await?;

        Ok(Outcome::Consolidated { profile: true })
    }

    /// Spawn the periodic loop: one cycle right away, then one per `interval`.
    pub fn start(self: Arc<Self>, interval: Duration) -> SchedulerHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let account = self.store.account().to_string();
        info!(
            account = %account,
            interval_secs = interval.as_secs(),
            "Consolidation scheduler started"
        );

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        self.run_cycle().await;
                    }
                }
            }
            info!(account = %account, "Consolidation scheduler stopped");
        });

        SchedulerHandle { stop_tx, handle }
    }
}

fn last(mut messages: Vec<Message>) -> Option<Message> {
    messages.pop()
}

/// Stops a running scheduler loop.
pub struct SchedulerHandle {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal the loop and wait for it; a cycle in progress runs to completion.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.handle.await {
            error!(error = %e, "Scheduler task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
