//! Per-request state
//!
//! Created once per question, mutated only by the orchestrator, dropped when
//! the answer is returned.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Who a conversation turn belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    /// A question asked by the user
    User,
    /// Generated code or a final answer
    Assistant,
    /// Guidance added by the pipeline (plan, schema, SQL, corrections)
    Context,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::User => f.write_str("User"),
            Speaker::Assistant => f.write_str("Assistant"),
            Speaker::Context => f.write_str("Context"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self { speaker: Speaker::User, text: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { speaker: Speaker::Assistant, text: text.into() }
    }

    pub fn context(text: impl Into<String>) -> Self {
        Self { speaker: Speaker::Context, text: text.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyVerdict {
    Safe,
    Unsafe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewVerdict {
    Approve,
    Reject(String),
}

#[derive(Debug, Clone)]
pub struct RequestState {
    /// Append-only during a run; the latest `User` turn is the active question
    pub conversation: Vec<Turn>,
    /// Generation attempts so far, never above `max_retries`
    pub iteration_count: u32,
    pub generated_code: String,
    pub generated_sql: Option<String>,
    /// Failure text of the last execution; cleared on regeneration
    pub last_error: Option<String>,
    /// Cleared after each generation
    pub last_review_verdict: Option<ReviewVerdict>,
    /// Set once by the input gate
    pub safety_verdict: Option<SafetyVerdict>,
    final_output: Option<String>,
    question_index: usize,
}

impl RequestState {
    pub fn new(question: impl Into<String>) -> Self {
        Self::resume(Vec::new(), question)
    }

    /// Continue a prior conversation with a new question
    pub fn resume(history: Vec<Turn>, question: impl Into<String>) -> Self {
        let mut conversation = history;
        conversation.push(Turn::user(question));
        let question_index = conversation.len() - 1;

        Self {
            conversation,
            iteration_count: 0,
            generated_code: String::new(),
            generated_sql: None,
            last_error: None,
            last_review_verdict: None,
            safety_verdict: None,
            final_output: None,
            question_index,
        }
    }

    /// The question this run answers
    pub fn question(&self) -> &str {
        &self.conversation[self.question_index].text
    }

    pub fn push(&mut self, turn: Turn) {
        self.conversation.push(turn);
    }

    /// Set the answer; only the first call has an effect
    pub fn finalize(&mut self, text: impl Into<String>) {
        if self.final_output.is_some() {
            warn!("final output already set, ignoring second value");
            return;
        }
        self.final_output = Some(text.into());
    }

    pub fn final_output(&self) -> Option<&str> {
        self.final_output.as_deref()
    }

    pub fn take_final_output(&mut self) -> Option<String> {
        self.final_output.take()
    }

    /// Conversation as one prompt, oldest turn first
    pub fn render(&self) -> String {
        self.conversation
            .iter()
            .map(|turn| format!("{}: {}", turn.speaker, turn.text))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}
