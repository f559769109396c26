//! LLM-backed summarizer.
//!
//! Sends an STM batch plus the previous output to a [`Provider`], asks for
//! a JSON object, and validates it against [`LtmSummary`] or
//! [`ProfileSummary`] before it may become a stored message.

use async_trait::async_trait;
use membase_core::error::SummarizationError;
use membase_core::message::{Message, Role, Tier};
use membase_core::provider::{Provider, ProviderRequest};
use membase_core::summarizer::Summarizer;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::debug;

const KEYWORD_RANGE: RangeInclusive<usize> = 3..=8;
const MEMORY_LEVEL_RANGE: RangeInclusive<u8> = 1..=5;

/// Five-way assessment attached to every LTM summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryAnalysis {
    pub semantic_complexity: String,
    pub long_term_value: String,
    pub profile_relevance: String,
    pub emotional_signal: String,
    pub knowledge_potential: String,
}

/// Content of an LTM-tier message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LtmSummary {
    pub summary: String,
    pub keywords: Vec<String>,
    /// 1 (trivial) to 5 (essential)
    pub memory_level: u8,
    pub analysis: MemoryAnalysis,
}

impl LtmSummary {
    pub fn validate(&self) -> Result<(), SummarizationError> {
        let invalid = |reason: String| SummarizationError::InvalidOutput {
            schema: "LtmSummary",
            reason,
        };
        if self.summary.trim().is_empty() {
            return Err(invalid("summary is empty".into()));
        }
        if !KEYWORD_RANGE.contains(&self.keywords.len()) {
            return Err(invalid(format!(
                "expected 3-8 keywords, got {}",
                self.keywords.len()
            )));
        }
        if !MEMORY_LEVEL_RANGE.contains(&self.memory_level) {
            return Err(invalid(format!(
                "memory_level must be 1-5, got {}",
                self.memory_level
            )));
        }
        Ok(())
    }
}

/// Content of a profile-tier message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub profile_summary: String,
    #[serde(default)]
    pub language_style: String,
    #[serde(default)]
    pub knowledge_level: String,
    #[serde(default)]
    pub interests: Vec<String>,
    #[serde(default)]
    pub preferences: Vec<String>,
    #[serde(default)]
    pub behavior_patterns: Vec<String>,
    #[serde(default)]
    pub goals: Vec<String>,
    pub tags: Vec<String>,
    /// What moved since the previous profile
    #[serde(default)]
    pub changes: String,
}

impl ProfileSummary {
    pub fn validate(&self) -> Result<(), SummarizationError> {
        let invalid = |reason: String| SummarizationError::InvalidOutput {
            schema: "ProfileSummary",
            reason,
        };
        if self.profile_summary.trim().is_empty() {
            return Err(invalid("profile_summary is empty".into()));
        }
        if !KEYWORD_RANGE.contains(&self.tags.len()) {
            return Err(invalid(format!("expected 3-8 tags, got {}", self.tags.len())));
        }
        Ok(())
    }
}

const LTM_INSTRUCTIONS: &str = r#"You maintain the long-term memory of an AI agent.
Summarize the conversation turns below into one memory entry. Carry forward
anything from the previous entry that is still relevant.
Reply with a single JSON object and nothing else:
{
  "summary": "<what happened and what matters, in prose>",
  "keywords": ["<3 to 8 keywords>"],
  "memory_level": <integer 1-5, how important this is to remember>,
  "analysis": {
    "semantic_complexity": "<assessment>",
    "long_term_value": "<assessment>",
    "profile_relevance": "<assessment>",
    "emotional_signal": "<emotions or intent expressed>",
    "knowledge_potential": "<reusable knowledge>"
  }
}"#;

const PROFILE_INSTRUCTIONS: &str = r#"You maintain the profile of the user an AI agent talks to.
Update the previous profile with what the conversation turns below reveal.
Reply with a single JSON object and nothing else:
{
  "profile_summary": "<who the user is>",
  "language_style": "<how they write>",
  "knowledge_level": "<expertise>",
  "interests": ["..."],
  "preferences": ["..."],
  "behavior_patterns": ["..."],
  "goals": ["..."],
  "tags": ["<3 to 8 tags>"],
  "changes": "<what changed since the previous profile>"
}"#;

/// A [`Summarizer`] that delegates to an LLM provider.
pub struct LlmSummarizer {
    provider: Arc<dyn Provider>,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    /// Author name written on produced messages
    author: String,
}

impl LlmSummarizer {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: 0.2,
            max_tokens: None,
            author: "membase".into(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    async fn ask<T>(
        &self,
        schema: &'static str,
        instructions: &str,
        batch: &[Message],
        previous: Option<&Message>,
    ) -> Result<T, SummarizationError>
    where
        T: DeserializeOwned + Send,
    {
        if batch.is_empty() {
            return Err(SummarizationError::EmptyBatch);
        }

        let request = ProviderRequest {
            model: self.model.clone(),
            messages: vec![
                Message::system(&self.author, instructions),
                Message::user(&self.author, render_prompt(batch, previous)),
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            json_mode: true,
        };

        let response = self.provider.complete(request).await?;
        debug!(
            provider = self.provider.name(),
            model = %response.model,
            chars = response.content.len(),
            "Summarizer reply received"
        );
        parse_json(&response.content, schema)
    }

    fn to_message<T: Serialize>(
        &self,
        summary: &T,
        tier: Tier,
    ) -> Result<Message, SummarizationError> {
        let content = serde_json::to_string(summary).map_err(|e| {
            SummarizationError::InvalidOutput {
                schema: "summary",
                reason: e.to_string(),
            }
        })?;
        Ok(Message::new(&self.author, Role::Assistant, content).with_tier(tier))
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    fn name(&self) -> &str {
        self.provider.name()
    }

    async fn summarize_ltm(
        &self,
        batch: &[Message],
        previous: Option<&Message>,
    ) -> Result<Message, SummarizationError> {
        let summary: LtmSummary = self
            .ask("LtmSummary", LTM_INSTRUCTIONS, batch, previous)
            .await?;
        summary.validate()?;
        self.to_message(&summary, Tier::Ltm)
    }

    async fn summarize_profile(
        &self,
        batch: &[Message],
        previous: Option<&Message>,
    ) -> Result<Message, SummarizationError> {
        let profile: ProfileSummary = self
            .ask("ProfileSummary", PROFILE_INSTRUCTIONS, batch, previous)
            .await?;
        profile.validate()?;
        self.to_message(&profile, Tier::Profile)
    }
}

/// `Previous:` block followed by one `[timestamp] role: content` line per turn.
fn render_prompt(batch: &[Message], previous: Option<&Message>) -> String {
    let previous = previous.map_or("none", |m| m.content.as_str());
    let turns: Vec<String> = batch
        .iter()
        .map(|m| format!("[{}] {}: {}", m.timestamp, m.role, m.content))
        .collect();
    format!("Previous:\n{previous}\n\nConversation:\n{}", turns.join("\n"))
}

/// Parse a model reply, tolerating Markdown fences and surrounding prose.
fn parse_json<T: DeserializeOwned>(
    raw: &str,
    schema: &'static str,
) -> Result<T, SummarizationError> {
    let body = strip_code_fences(raw);
    let body = match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if start < end => &body[start..=end],
        _ => body,
    };
    serde_json::from_str(body).map_err(|e| SummarizationError::InvalidOutput {
        schema,
        reason: e.to_string(),
    })
}

fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (```json) up to the first newline.
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use membase_core::error::ProviderError;
    use membase_core::provider::ProviderResponse;
    use std::sync::Mutex;

    /// Returns canned replies in order and records each prompt.
    struct ScriptedProvider {
        replies: Mutex<Vec<Result<String, ProviderError>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<Result<String, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            request: ProviderRequest,
        ) -> Result<ProviderResponse, ProviderError> {
            assert!(request.json_mode);
            self.prompts
                .lock()
                .unwrap()
                .push(request.messages[1].content.clone());
            let content = self.replies.lock().unwrap().remove(0)?;
            Ok(ProviderResponse {
                content,
                usage: None,
                model: request.model,
            })
        }
    }

    const LTM_REPLY: &str = r#"{"summary":"Alice is learning Rust lifetimes.",
        "keywords":["rust","lifetimes","learning"],"memory_level":3,
        "analysis":{"semantic_complexity":"medium","long_term_value":"high",
        "profile_relevance":"high","emotional_signal":"curious","knowledge_potential":"high"}}"#;

    const PROFILE_REPLY: &str = r#"{"profile_summary":"A backend developer moving to Rust.",
        "tags":["rust","backend","learner"],"interests":["systems"],"changes":"first profile"}"#;

    fn batch() -> Vec<Message> {
        vec![
            Message::user("alice", "How do lifetimes work?").with_timestamp("2025-01-01 10:00:00"),
            Message::assistant("bot", "They bound references.")
                .with_timestamp("2025-01-01 10:00:05"),
        ]
    }

    #[tokio::test]
    async fn ltm_summary_becomes_ltm_message() {
        let provider = ScriptedProvider::new(vec![Ok(LTM_REPLY.into())]);
        let summarizer = LlmSummarizer::new(provider.clone(), "gpt-test");

        let msg = summarizer.summarize_ltm(&batch(), None).await.unwrap();
        assert_eq!(msg.tier, Tier::Ltm);
        assert_eq!(msg.role, Role::Assistant);
        let parsed: LtmSummary = serde_json::from_str(&msg.content).unwrap();
        assert_eq!(parsed.memory_level, 3);

        let prompt = provider.prompts.lock().unwrap()[0].clone();
        assert!(prompt.starts_with("Previous:\nnone"));
        assert!(prompt.contains("[2025-01-01 10:00:00] user: How do lifetimes work?"));
        assert!(prompt.contains("[2025-01-01 10:00:05] assistant: They bound references."));
    }

    #[tokio::test]
    async fn previous_output_is_in_the_prompt() {
        let provider = ScriptedProvider::new(vec![Ok(format!("```json\n{PROFILE_REPLY}\n```"))]);
        let summarizer = LlmSummarizer::new(provider.clone(), "gpt-test");
        let previous = Message::assistant("membase", "OLD PROFILE").with_tier(Tier::Profile);

        let msg = summarizer
            .summarize_profile(&batch(), Some(&previous))
            .await
            .unwrap();
        assert_eq!(msg.tier, Tier::Profile);
        assert!(provider.prompts.lock().unwrap()[0].contains("OLD PROFILE"));
    }

    #[tokio::test]
    async fn out_of_range_fields_are_rejected() {
        let too_few = r#"{"summary":"x","keywords":["a"],"memory_level":3,
            "analysis":{"semantic_complexity":"","long_term_value":"","profile_relevance":"",
            "emotional_signal":"","knowledge_potential":""}}"#;
        let bad_level = LTM_REPLY.replace("\"memory_level\":3", "\"memory_level\":9");
        let provider = ScriptedProvider::new(vec![Ok(too_few.into()), Ok(bad_level)]);
        let summarizer = LlmSummarizer::new(provider, "gpt-test");

        for _ in 0..2 {
            let err = summarizer.summarize_ltm(&batch(), None).await.unwrap_err();
            assert!(matches!(
                err,
                SummarizationError::InvalidOutput { schema: "LtmSummary", .. }
            ));
        }
    }

    #[tokio::test]
    async fn unparsable_reply_is_invalid_output() {
        let provider = ScriptedProvider::new(vec![Ok("I cannot do that.".into())]);
        let summarizer = LlmSummarizer::new(provider, "gpt-test");
        let err = summarizer.summarize_profile(&batch(), None).await.unwrap_err();
        assert!(matches!(
            err,
            SummarizationError::InvalidOutput { schema: "ProfileSummary", .. }
        ));
    }

    #[tokio::test]
    async fn provider_failure_propagates() {
        let provider = ScriptedProvider::new(vec![Err(ProviderError::Network("timeout".into()))]);
        let summarizer = LlmSummarizer::new(provider, "gpt-test");
        assert!(matches!(
            summarizer.summarize_ltm(&batch(), None).await,
            Err(SummarizationError::Provider(ProviderError::Network(_)))
        ));
    }

    #[tokio::test]
    async fn empty_batch_is_rejected() {
        let provider = ScriptedProvider::new(vec![]);
        let summarizer = LlmSummarizer::new(provider, "gpt-test");
        assert!(matches!(
            summarizer.summarize_ltm(&[], None).await,
            Err(SummarizationError::EmptyBatch)
        ));
    }

    #[test]
    fn fences_and_prose_are_stripped() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("  {}  "), "{}");
        let parsed: serde_json::Value =
            parse_json("Here you go: {\"a\": 1} hope it helps", "LtmSummary").unwrap();
        assert_eq!(parsed["a"], 1);
    }
}
