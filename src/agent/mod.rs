//! Audit agent
//!
//! Turns one natural-language question into one answer:
//!
//! ```text
//! question ─► Orchestrator ─► roles (Ollama)      plan, SQL, code, verdicts
//!                  │
//!                  ├────────► ToolService          schema context
//!                  │
//!                  └────────► CodeExecutor         sandboxed run
//!                  │
//!                  ▼
//!             AuditResult ─► SessionStore          follow-up questions
//! ```

pub mod orchestrator;
pub mod sessions;
pub mod state;

pub use orchestrator::{
    route_after_execution, route_after_review, AuditConfig, AuditError, AuditResult, AuditStatus,
    Orchestrator, Stage, EMPTY_OUTPUT_MESSAGE, REDACTION_MESSAGE, REFUSAL_MESSAGE,
};
pub use sessions::{Session, SessionConfig, SessionError, SessionStore, SessionSummary};
pub use state::{RequestState, ReviewVerdict, SafetyVerdict, Speaker, Turn};
