//! Consolidation and account lifecycle for Membase.
//!
//! - [`ConsolidationScheduler`]: the background loop that distils full STM
//!   batches into LTM entries and the account profile
//! - [`LlmSummarizer`]: a [`Summarizer`] over any chat-completion provider
//! - [`MemoryManager`] / [`MemoryRegistry`]: one account's store, sync
//!   worker and scheduler, opened and closed explicitly
//!
//! [`Summarizer`]: membase_core::Summarizer

pub mod manager;
pub mod registry;
pub mod scheduler;
pub mod summarizer;

pub use manager::{BackendSpec, ManagerBuilder, ManagerOptions, MemoryManager};
pub use registry::MemoryRegistry;
pub use scheduler::{BatchWindow, ConsolidationScheduler, CycleReport, SchedulerHandle, due_batch};
pub use summarizer::{LlmSummarizer, LtmSummary, MemoryAnalysis, ProfileSummary};
