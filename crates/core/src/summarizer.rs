//! Summarizer trait: distils an STM batch into an LTM entry or a profile.
//!
//! The call is opaque (usually an LLM round-trip) and may fail or return
//! content that does not parse; both surface as [`SummarizationError`].

use async_trait::async_trait;

use crate::error::SummarizationError;
use crate::message::Message;

#[async_trait]
pub trait Summarizer: Send + Sync {
    fn name(&self) -> &str;

    /// Produce one LTM-tier message from `batch`, given the previous LTM entry.
    async fn summarize_ltm(
        &self,
        batch: &[Message],
        previous: Option<&Message>,
    ) -> Result<Message, SummarizationError>;

    /// Produce one profile-tier message from `batch`, given the previous profile.
    async fn summarize_profile(
        &self,
        batch: &[Message],
        previous: Option<&Message>,
    ) -> Result<Message, SummarizationError>;
}
