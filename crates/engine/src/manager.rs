//! Per-account memory manager.
//!
//! A [`MemoryManager`] owns one account's [`MessageStore`], the sync worker
//! mirroring it and the consolidation loop reading from it. It is opened by a
//! [`ManagerBuilder`] and lives until [`MemoryManager::close`].

use membase_config::TriggerRule;
use membase_core::error::{Error, Result, StoreError};
use membase_core::hub::HubTransport;
use membase_core::message::{Message, Tier};
use membase_core::store::MessageBackend;
use membase_core::summarizer::Summarizer;
use membase_core::{profile_conversation_id, wire};
use membase_hub::SyncQueue;
use membase_memory::{InMemoryBackend, InMemoryKnowledgeIndex, MessageStore, SqliteBackend};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::scheduler::{ConsolidationScheduler, CycleReport, SchedulerHandle};

/// Where an account's records are persisted.
#[derive(Debug, Clone)]
pub enum BackendSpec {
    /// Nothing survives the process
    InMemory,
    /// `<root>/<account>/sql.db`
    Sqlite { root: PathBuf },
}

/// Knobs shared by every manager a builder opens.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub batch_size: u64,
    pub tick_interval: Duration,
    pub trigger: TriggerRule,
    /// Start the periodic loop (needs a summarizer)
    pub consolidate: bool,
    /// Mirror committed records to the hub (needs a transport)
    pub auto_upload: bool,
    /// Bucket override for records without a name
    pub hub_id: Option<String>,
    /// Pull the account's conversations from the hub on open
    pub preload: bool,
    /// Index committed messages for keyword retrieval
    pub keyword_index: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            batch_size: 16,
            tick_interval: Duration::from_secs(60),
            trigger: TriggerRule::default(),
            consolidate: true,
            auto_upload: false,
            hub_id: None,
            preload: false,
            keyword_index: false,
        }
    }
}

/// Opens managers with a fixed backend, hub and summarizer wiring.
#[derive(Clone)]
pub struct ManagerBuilder {
    backend: BackendSpec,
    options: ManagerOptions,
    hub: Option<Arc<dyn HubTransport>>,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl ManagerBuilder {
    pub fn new(backend: BackendSpec) -> Self {
        Self {
            backend,
            options: ManagerOptions::default(),
            hub: None,
            summarizer: None,
        }
    }

    pub fn options(mut self, options: ManagerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn hub(mut self, hub: Arc<dyn HubTransport>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    async fn backend_for(&self, account: &str) -> Result<Arc<dyn MessageBackend>> {
        Ok(match &self.backend {
            BackendSpec::InMemory => Arc::new(InMemoryBackend::new()),
            BackendSpec::Sqlite { root } => {
                let path = root.join(account).join("sql.db");
                Arc::new(SqliteBackend::open(&path).await?)
            }
        })
    }

    /// Open `account`: storage first, then hub preload, then the background loops.
    pub async fn open(&self, account: &str) -> Result<MemoryManager> {
        if account.trim().is_empty() {
            return Err(StoreError::InvalidArgument("account is empty".into()).into());
        }
        let options = &self.options;
        let backend = self.backend_for(account).await?;

        let mut store = MessageStore::new(account, backend.clone());
        if options.keyword_index {
            store = store.with_knowledge(Arc::new(InMemoryKnowledgeIndex::new()));
        }
        if options.auto_upload {
            match &self.hub {
                Some(hub) => {
                    let queue = SyncQueue::start(hub.clone(), Some(backend));
                    store = store.with_sync(queue, options.hub_id.clone());
                }
                None => warn!(account, "auto_upload is set but no hub is configured"),
            }
        }
        let store = Arc::new(store);

        let scheduler = self.summarizer.as_ref().map(|summarizer| {
            Arc::new(
                ConsolidationScheduler::new(store.clone(), summarizer.clone(), options.batch_size)
                    .with_trigger(options.trigger),
            )
        });

        let manager = MemoryManager {
            account: account.to_string(),
            store,
            hub: self.hub.clone(),
            scheduler: scheduler.clone(),
            handle: tokio::sync::Mutex::new(None),
            default_conversation: RwLock::new(new_conversation_id()),
            preloaded: Mutex::new(HashSet::new()),
        };

        if options.preload && manager.hub.is_some() {
            match manager.load_all_from_hub().await {
                Ok(loaded) => info!(account, loaded, "Preloaded conversations from hub"),
                Err(e) => warn!(account, error = %e, "Hub preload failed"),
            }
        }

        if options.consolidate
            && let Some(scheduler) = scheduler
        {
            *manager.handle.lock().await = Some(scheduler.start(options.tick_interval));
        }

        info!(account, "Memory manager opened");
        Ok(manager)
    }
}

fn new_conversation_id() -> String {
    Uuid::new_v4().to_string()
}

/// One account's memory.
pub struct MemoryManager {
    account: String,
    store: Arc<MessageStore>,
    hub: Option<Arc<dyn HubTransport>>,
    scheduler: Option<Arc<ConsolidationScheduler>>,
    handle: tokio::sync::Mutex<Option<SchedulerHandle>>,
    default_conversation: RwLock<String>,
    /// Conversations already pulled from the hub
    preloaded: Mutex<HashSet<String>>,
}

impl MemoryManager {
    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn default_conversation_id(&self) -> String {
        self.default_conversation
            .read()
            .map(|id| id.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Switch the default conversation; `None` starts a fresh one.
    pub fn update_conversation_id(&self, conversation_id: Option<String>) -> String {
        let id = conversation_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(new_conversation_id);
        match self.default_conversation.write() {
            Ok(mut current) => *current = id.clone(),
            Err(poisoned) => *poisoned.into_inner() = id.clone(),
        }
        debug!(account = %self.account, conversation_id = %id, "Default conversation changed");
        id
    }

    fn resolve(&self, conversation_id: Option<&str>) -> String {
        conversation_id
            .map(str::to_string)
            .unwrap_or_else(|| self.default_conversation_id())
    }

    /// Add to the default conversation, in the tier the message declares.
    pub async fn add(&self, message: Message) -> Result<Message> {
        let conversation_id = self.default_conversation_id();
        self.add_to(&conversation_id, message).await
    }

    pub async fn add_to(&self, conversation_id: &str, message: Message) -> Result<Message> {
        let tier = message.tier;
        Ok(self.store.add(conversation_id, tier, message).await?)
    }

    /// STM turns, oldest first.
    pub async fn get(
        &self,
        conversation_id: Option<&str>,
        recent_n: Option<usize>,
    ) -> Result<Vec<Message>> {
        let id = self.resolve(conversation_id);
        Ok(self.store.get(&id, Tier::Stm, recent_n).await?)
    }

    pub async fn get_ltm(
        &self,
        conversation_id: Option<&str>,
        recent_n: Option<usize>,
    ) -> Result<Vec<Message>> {
        let id = self.resolve(conversation_id);
        Ok(self.store.get(&id, Tier::Ltm, recent_n).await?)
    }

    /// The account's profile history.
    pub async fn get_profile(&self, recent_n: Option<usize>) -> Result<Vec<Message>> {
        let id = profile_conversation_id(&self.account);
        Ok(self.store.get(&id, Tier::Profile, recent_n).await?)
    }

    pub async fn delete(
        &self,
        conversation_id: Option<&str>,
        tier: Tier,
        indices: &[u64],
    ) -> Result<usize> {
        let id = self.resolve(conversation_id);
        Ok(self.store.delete(&id, tier, indices).await?)
    }

    pub async fn clear(&self, conversation_id: Option<&str>, tier: Option<Tier>) -> Result<usize> {
        let id = self.resolve(conversation_id);
        Ok(self.store.clear(&id, tier).await?)
    }

    pub async fn size(&self, conversation_id: Option<&str>, tier: Tier) -> Result<usize> {
        let id = self.resolve(conversation_id);
        Ok(self.store.size(&id, tier).await?)
    }

    pub async fn conversations(&self) -> Result<Vec<String>> {
        Ok(self.store.list_conversations().await?)
    }

    pub fn is_preloaded(&self, conversation_id: &str) -> bool {
        self.preloaded
            .lock()
            .map(|set| set.contains(conversation_id))
            .unwrap_or(false)
    }

    fn hub(&self) -> Result<&Arc<dyn HubTransport>> {
        self.hub.as_ref().ok_or_else(|| Error::Config {
            message: "no hub configured".into(),
        })
    }

    /// Pull one conversation from the hub into local storage.
    ///
    /// Records keep their declared tier and are not uploaded again. A
    /// conversation is pulled at most once per manager; records that fail
    /// to decode are skipped.
    pub async fn load_from_hub(&self, conversation_id: &str) -> Result<usize> {
        if self.is_preloaded(conversation_id) {
            return Ok(0);
        }
        let hub = self.hub()?;
        let records = hub.get_conversation(&self.account, conversation_id).await?;

        let mut loaded = 0;
        for raw in &records {
            let message = match wire::decode(raw) {
                Ok(message) => message,
                Err(e) => {
                    warn!(conversation_id, error = %e, "Skipping undecodable hub record");
                    continue;
                }
            };
            let tier = message.tier;
            match self.store.add_local(conversation_id, tier, message).await {
                Ok(_) => loaded += 1,
                Err(e) => warn!(conversation_id, error = %e, "Cannot store hub record"),
            }
        }

        if let Ok(mut set) = self.preloaded.lock() {
            set.insert(conversation_id.to_string());
        }
        debug!(conversation_id, loaded, total = records.len(), "Loaded conversation from hub");
        Ok(loaded)
    }

    /// Pull every conversation the hub holds for this account.
    pub async fn load_all_from_hub(&self) -> Result<usize> {
        let ids = self.hub()?.list_conversations(&self.account).await?;
        let mut loaded = 0;
        for id in ids {
            match self.load_from_hub(&id).await {
                Ok(n) => loaded += n,
                Err(e) => warn!(conversation_id = %id, error = %e, "Hub conversation not loaded"),
            }
        }
        Ok(loaded)
    }

    /// Run one consolidation cycle now. `None` without a summarizer.
    pub async fn consolidate_now(&self) -> Option<CycleReport> {
        match &self.scheduler {
            Some(scheduler) => Some(scheduler.run_cycle().await),
            None => None,
        }
    }

    pub async fn is_consolidating(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the consolidation loop, then drain and stop the sync worker.
    /// Calling it again does nothing.
    pub async fn close(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.stop().await;
        }
        if let Some(queue) = self.store.sync_queue()
            && !queue.is_closed()
        {
            queue.close().await;
        }
        info!(account = %self.account, "Memory manager closed");
    }
}
