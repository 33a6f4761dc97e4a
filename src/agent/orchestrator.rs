//! Orchestrator - the audit state machine
//!
//! Drives one question from the input gate to a single answer (or refusal),
//! calling each generation role at most once per visit and the sandbox once
//! per attempt.
//!
//! ```text
//!   InputGate ──UNSAFE──────────────────────────────────────────► Done
//!       │
//!   Planning ──► SchemaContext ──► SqlGenerate ──► SqlCheck ─┐
//!       │            (sql_first only)                        │
//!       └────────────────────────────────────────────────────┤
//!                                                            ▼
//!          ┌─────────────────────────────────────────► CodeGenerate ◄──┐
//!          │                                               │           │
//!          │ REJECT, retries left                      CodeReview      │
//!          └───────────────────────────────────────────────┤           │
//!                                                          ▼           │
//!                                                       Execute ───────┘
//!                                                          │  failed, retries left
//!                                        failed, no retries│ok
//!                                      Done ◄──────────────┤
//!                                                          ▼
//!                                                     OutputGate ──► Done
//! ```
//!
//! Role failures (transport, empty reply, timeout) end the request with an
//! [`AuditError`]; they are never retried. Code that fails review or
//! execution is regenerated until `max_retries` attempts have been spent.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::sessions::{Session, SessionError, SessionStore};
use super::state::{RequestState, ReviewVerdict, SafetyVerdict, Turn};
use crate::metrics::{
    AUDIT_ITERATIONS, AUDIT_REQUESTS, AUDIT_TRANSITIONS, ROLE_CALLS, ROLE_CALL_DURATION,
};
use crate::roles::{
    is_rejection, is_unsafe_input, is_unsafe_output, parse_sql_check, strip_code_fences,
    RoleError, RoleId, Roles, SqlCheck,
};
use crate::sandbox::{classify_output, CodeExecutor, FailureKind};
use crate::tools::ToolService;

/// Answer given when the input gate refuses a question
pub const REFUSAL_MESSAGE: &str = "I can only help with questions about public financial data \
     (tenders, expenses and revenues). This request was declined.";

/// Answer given when the output gate withholds a result
pub const REDACTION_MESSAGE: &str =
    "The result was withheld because it may contain sensitive information.";

/// Answer given when successful code printed nothing
pub const EMPTY_OUTPUT_MESSAGE: &str = "The analysis ran successfully but produced no output.";

// ═══════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Code generation attempts per question
    pub max_retries: u32,
    /// Maximum stage transitions per question
    pub step_budget: u32,
    /// Prepare a SQL query before generating code
    pub sql_first: bool,
    /// How many datasets the schema stage describes
    pub schema_dataset_limit: usize,
    pub role_timeout_secs: u64,
    /// Deadline for one sandbox execution, image pull included
    pub execution_deadline_secs: u64,
    /// Consecutive infrastructure failures before giving up on the sandbox
    pub max_sandbox_failures: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            step_budget: 30,
            sql_first: true,
            schema_dataset_limit: 8,
            role_timeout_secs: 180,
            execution_deadline_secs: 90,
            max_sandbox_failures: 2,
        }
    }
}

impl AuditConfig {
    /// Transitions of the longest legal run: five stages before the first
    /// attempt, three per attempt, then the output gate
    pub fn min_step_budget(&self) -> u32 {
        self.max_retries.saturating_mul(3).saturating_add(6)
    }

    /// At least one attempt, and a step budget that never fires before the
    /// retry ceiling
    pub fn normalized(mut self) -> Self {
        if self.max_retries == 0 {
            warn!("max_retries of 0 raised to 1");
            self.max_retries = 1;
        }
        let floor = self.min_step_budget();
        if self.step_budget < floor {
            warn!(configured = self.step_budget, floor, "Step budget raised to cover every retry");
            self.step_budget = floor;
        }
        self
    }

    pub fn role_timeout(&self) -> Duration {
        Duration::from_secs(self.role_timeout_secs)
    }

    pub fn execution_deadline(&self) -> Duration {
        Duration::from_secs(self.execution_deadline_secs)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Stages & results
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    InputGate,
    Planning,
    SchemaContext,
    SqlGenerate,
    SqlCheck,
    CodeGenerate,
    CodeReview,
    Execute,
    OutputGate,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::InputGate => "input_gate",
            Stage::Planning => "planning",
            Stage::SchemaContext => "schema_context",
            Stage::SqlGenerate => "sql_generate",
            Stage::SqlCheck => "sql_check",
            Stage::CodeGenerate => "code_generate",
            Stage::CodeReview => "code_review",
            Stage::Execute => "execute",
            Stage::OutputGate => "output_gate",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a question ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    /// Code ran and the output gate produced the answer
    Answered,
    /// The input gate declined the question
    Refused,
    /// Every attempt failed; the answer is the last failure text
    Exhausted,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Answered => "answered",
            AuditStatus::Refused => "refused",
            AuditStatus::Exhausted => "exhausted",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditResult {
    pub answer: String,
    pub status: AuditStatus,
    /// Code generation attempts used
    pub iterations: u32,
    pub transitions: u32,
    /// Pass back to `run` to ask a follow-up in the same conversation
    pub continuation_token: Option<String>,
    pub trace_id: String,
    pub generated_sql: Option<String>,
    pub generated_code: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("question is empty")]
    EmptyQuestion,

    #[error("{role} failed: {source}")]
    Role {
        role: RoleId,
        #[source]
        source: RoleError,
    },

    #[error("stage {stage} timed out after {timeout:?}")]
    StageTimeout { stage: Stage, timeout: Duration },

    #[error("step budget of {0} transitions exceeded")]
    StepBudgetExceeded(u32),

    #[error("sandbox unavailable after {failures} consecutive failures: {last_error}")]
    SandboxUnavailable { failures: u32, last_error: String },

    #[error("continuation token given but sessions are disabled")]
    SessionsDisabled,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("run ended without an answer")]
    Incomplete,
}

// ═══════════════════════════════════════════════════════════════════════════
// Routing
// ═══════════════════════════════════════════════════════════════════════════

/// Where a reviewed attempt goes next
///
/// A rejection sends the code back while attempts remain; once they are
/// spent the rejected code runs anyway.
pub fn route_after_review(verdict: &ReviewVerdict, iteration_count: u32, max_retries: u32) -> Stage {
    match verdict {
        ReviewVerdict::Reject(_) if iteration_count < max_retries => Stage::CodeGenerate,
        _ => Stage::Execute,
    }
}

/// Where an executed attempt goes next
pub fn route_after_execution(failed: bool, iteration_count: u32, max_retries: u32) -> Stage {
    match (failed, iteration_count < max_retries) {
        (false, _) => Stage::OutputGate,
        (true, true) => Stage::CodeGenerate,
        (true, false) => Stage::Done,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════════════════════

/// Bookkeeping for one run that does not belong in `RequestState`
struct RunControl {
    trace_id: String,
    status: AuditStatus,
    /// Successful output waiting for the output gate
    candidate: Option<String>,
    /// Consecutive `System Error` results
    infra_failures: u32,
}

pub struct Orchestrator {
    roles: Roles,
    executor: Arc<dyn CodeExecutor>,
    tools: Option<Arc<dyn ToolService>>,
    sessions: Option<SessionStore>,
    config: AuditConfig,
}

impl Orchestrator {
    pub fn new(roles: Roles, executor: Arc<dyn CodeExecutor>, config: AuditConfig) -> Self {
        Self {
            roles,
            executor,
            tools: None,
            sessions: None,
            config: config.normalized(),
        }
    }

    /// Tool Service used to build schema context for SQL generation
    pub fn with_tools(mut self, tools: Arc<dyn ToolService>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Persist conversations so follow-up questions can resume them
    pub fn with_sessions(mut self, store: SessionStore) -> Self {
        self.sessions = Some(store);
        self
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// Answer one question
    ///
    /// `continuation_token` resumes the conversation a previous result
    /// returned. Exactly one answer comes back, or a typed error.
    pub async fn run(
        &self,
        question: &str,
        continuation_token: Option<&str>,
    ) -> Result<AuditResult, AuditError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(AuditError::EmptyQuestion);
        }

        let trace_id = Uuid::now_v7().to_string();
        let span = info_span!(
            "audit_request",
            trace_id = %trace_id,
            resumed = continuation_token.is_some(),
            otel.name = "audit_request"
        );

        let result = self
            .run_inner(question, continuation_token, trace_id)
            .instrument(span)
            .await;

        let outcome = match &result {
            Ok(r) => r.status.as_str(),
            Err(_) => "error",
        };
        AUDIT_REQUESTS.with_label_values(&[outcome]).inc();
        result
    }

    async fn run_inner(
        &self,
        question: &str,
        continuation_token: Option<&str>,
        trace_id: String,
    ) -> Result<AuditResult, AuditError> {
        let mut session = match (continuation_token, &self.sessions) {
            (Some(token), Some(store)) => Some(store.load(token)?),
            (Some(_), None) => return Err(AuditError::SessionsDisabled),
            (None, Some(_)) => Some(Session::new(question)),
            (None, None) => None,
        };

        let history = session.as_ref().map(Session::history).unwrap_or_default();
        let mut state = RequestState::resume(history, question);
        let mut ctl = RunControl {
            trace_id,
            status: AuditStatus::Answered,
            candidate: None,
            infra_failures: 0,
        };

        info!(trace_id = %ctl.trace_id, question = %question, "Starting audit request");

        let mut stage = Stage::InputGate;
        let mut transitions: u32 = 0;
        while stage != Stage::Done {
            transitions += 1;
            if transitions > self.config.step_budget {
                warn!(budget = self.config.step_budget, stage = %stage, "Step budget exceeded");
                return Err(AuditError::StepBudgetExceeded(self.config.step_budget));
            }

            let span = info_span!("stage", stage = %stage, otel.name = stage.as_str());
            let next = self.step(stage, &mut state, &mut ctl).instrument(span).await?;
            debug!(from = %stage, to = %next, iteration = state.iteration_count, "Transition");
            stage = next;
        }

        let answer = state.take_final_output().ok_or(AuditError::Incomplete)?;

        AUDIT_ITERATIONS.observe(state.iteration_count as f64);
        AUDIT_TRANSITIONS.observe(transitions as f64);
        info!(
            trace_id = %ctl.trace_id,
            status = ctl.status.as_str(),
            iterations = state.iteration_count,
            transitions,
            "Audit request complete"
        );

        let continuation_token = match (session.as_mut(), &self.sessions) {
            (Some(session), Some(store)) => {
                session.record_exchange(question, answer.as_str());
                match store.save(session) {
                    Ok(()) => Some(session.id.clone()),
                    Err(e) => {
                        warn!(error = %e, session = %session.id, "Failed to save session");
                        None
                    }
                }
            }
            _ => None,
        };

        Ok(AuditResult {
            answer,
            status: ctl.status,
            iterations: state.iteration_count,
            transitions,
            continuation_token,
            trace_id: ctl.trace_id,
            generated_sql: state.generated_sql,
            generated_code: Some(state.generated_code).filter(|c| !c.is_empty()),
        })
    }

    /// Run one stage and pick the next
    async fn step(
        &self,
        stage: Stage,
        state: &mut RequestState,
        ctl: &mut RunControl,
    ) -> Result<Stage, AuditError> {
        match stage {
            Stage::InputGate => self.input_gate(state, ctl).await,
            Stage::Planning => self.plan(state).await,
            Stage::SchemaContext => {
                self.schema_context(state).await;
                Ok(Stage::SqlGenerate)
            }
            Stage::SqlGenerate => self.generate_sql(state).await,
            Stage::SqlCheck => self.check_sql(state).await,
            Stage::CodeGenerate => self.generate_code(state).await,
            Stage::CodeReview => self.review_code(state).await,
            Stage::Execute => self.execute(state, ctl).await,
            Stage::OutputGate => self.output_gate(state, ctl).await,
            Stage::Done => Ok(Stage::Done),
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Stages
    // ───────────────────────────────────────────────────────────────────────

    async fn input_gate(
        &self,
        state: &mut RequestState,
        ctl: &mut RunControl,
    ) -> Result<Stage, AuditError> {
        let verdict = self
            .call_role(Stage::InputGate, RoleId::InputGate, state.question())
            .await?;

        if is_unsafe_input(&verdict) {
            info!(verdict = %verdict, "Question refused by input gate");
            state.safety_verdict = Some(SafetyVerdict::Unsafe);
            state.finalize(REFUSAL_MESSAGE);
            ctl.status = AuditStatus::Refused;
            return Ok(Stage::Done);
        }

        state.safety_verdict = Some(SafetyVerdict::Safe);
        Ok(Stage::Planning)
    }

    async fn plan(&self, state: &mut RequestState) -> Result<Stage, AuditError> {
        let plan = self
            .call_role(Stage::Planning, RoleId::Planner, &state.render())
            .await?;
        state.push(Turn::context(format!(
            "Here is the execution plan you must follow:\n{}",
            plan.trim()
        )));

        Ok(if self.config.sql_first {
            Stage::SchemaContext
        } else {
            Stage::CodeGenerate
        })
    }

    /// Table list and DDL for the SQL generator
    ///
    /// Best-effort: a Tool Service failure only costs the SQL generator its
    /// context.
    async fn schema_context(&self, state: &mut RequestState) {
        let Some(tools) = &self.tools else {
            debug!("No tool service configured, skipping schema context");
            return;
        };

        let datasets = match tokio::time::timeout(self.config.role_timeout(), tools.list_datasets()).await {
            Ok(Ok(datasets)) => datasets,
            Ok(Err(e)) => {
                warn!(error = %e, "Could not list datasets");
                return;
            }
            Err(_) => {
                warn!("Listing datasets timed out");
                return;
            }
        };
        if datasets.is_empty() {
            warn!("Tool service has no datasets");
            return;
        }

        state.push(Turn::context(format!("Available tables: {}", datasets.join(", "))));

        let selected = &datasets[..datasets.len().min(self.config.schema_dataset_limit)];
        let described = tokio::time::timeout(
            self.config.role_timeout(),
            join_all(selected.iter().map(|name| tools.describe(name))),
        )
        .await;

        let Ok(described) = described else {
            warn!("Describing datasets timed out");
            return;
        };

        let schemas: Vec<String> = selected
            .iter()
            .zip(described)
            .filter_map(|(name, result)| match result {
                Ok(ddl) => Some(ddl),
                Err(e) => {
                    warn!(dataset = %name, error = %e, "Could not describe dataset");
                    None
                }
            })
            .collect();

        if !schemas.is_empty() {
            state.push(Turn::context(format!("Schema Context:\n{}", schemas.join("\n\n"))));
        }
    }

    async fn generate_sql(&self, state: &mut RequestState) -> Result<Stage, AuditError> {
        let reply = self
            .call_role(Stage::SqlGenerate, RoleId::SqlGenerator, &state.render())
            .await?;
        let sql = strip_code_fences(&reply);
        debug!(sql = %sql, "SQL generated");
        state.generated_sql = Some(sql);
        Ok(Stage::SqlCheck)
    }

    /// One check, at most one correction
    async fn check_sql(&self, state: &mut RequestState) -> Result<Stage, AuditError> {
        let sql = state.generated_sql.clone().unwrap_or_default();
        let context = format!("{}\n\nQuery to check:\n{}", state.render(), sql);
        let reply = self
            .call_role(Stage::SqlCheck, RoleId::SqlChecker, &context)
            .await?;

        let sql = match parse_sql_check(&reply) {
            SqlCheck::Valid => sql,
            SqlCheck::Corrected(corrected) => {
                info!(original = %sql, corrected = %corrected, "SQL corrected by checker");
                corrected
            }
        };

        state.push(Turn::context(format!(
            "Use this SQL query to answer the question:\n```sql\n{}\n```",
            sql
        )));
        state.generated_sql = Some(sql);
        Ok(Stage::CodeGenerate)
    }

    async fn generate_code(&self, state: &mut RequestState) -> Result<Stage, AuditError> {
        if let Some(error) = state.last_error.take() {
            state.push(Turn::context(format!(
                "The previous code failed with this error:\n{}\nPlease fix the code and try again.",
                error
            )));
        }
        if let Some(ReviewVerdict::Reject(reason)) = state.last_review_verdict.take() {
            state.push(Turn::context(format!(
                "The code was rejected by the reviewer:\n{}\nPlease fix the logic errors.",
                reason
            )));
        }

        let reply = self
            .call_role(Stage::CodeGenerate, RoleId::CodeGenerator, &state.render())
            .await?;
        let code = strip_code_fences(&reply);

        state.iteration_count += 1;
        info!(attempt = state.iteration_count, max = self.config.max_retries, "Code generated");
        state.generated_code = code.clone();
        state.push(Turn::assistant(code));
        Ok(Stage::CodeReview)
    }

    async fn review_code(&self, state: &mut RequestState) -> Result<Stage, AuditError> {
        let context = format!(
            "User Question: {}\n\nGenerated Code:\n```python\n{}\n```",
            state.question(),
            state.generated_code
        );
        let reply = self
            .call_role(Stage::CodeReview, RoleId::Critic, &context)
            .await?;

        let verdict = if is_rejection(&reply) {
            ReviewVerdict::Reject(reply)
        } else {
            ReviewVerdict::Approve
        };

        let next = route_after_review(&verdict, state.iteration_count, self.config.max_retries);
        if let ReviewVerdict::Reject(reason) = &verdict {
            if next == Stage::Execute {
                warn!(reason = %reason, "Code rejected with no attempts left, executing anyway");
            } else {
                info!(reason = %reason, "Code rejected by critic");
            }
        }
        state.last_review_verdict = Some(verdict);
        Ok(next)
    }

    async fn execute(
        &self,
        state: &mut RequestState,
        ctl: &mut RunControl,
    ) -> Result<Stage, AuditError> {
        let deadline = self.config.execution_deadline();
        let output = tokio::time::timeout(
            deadline,
            self.executor.execute(&state.generated_code, &ctl.trace_id),
        )
        .await
        .map_err(|_| AuditError::StageTimeout {
            stage: Stage::Execute,
            timeout: deadline,
        })?;

        let Some(kind) = classify_output(&output) else {
            ctl.infra_failures = 0;
            ctl.candidate = Some(output);
            return Ok(Stage::OutputGate);
        };

        if kind == FailureKind::Infrastructure {
            ctl.infra_failures += 1;
            let limit = self.config.max_sandbox_failures;
            if limit > 0 && ctl.infra_failures >= limit {
                return Err(AuditError::SandboxUnavailable {
                    failures: ctl.infra_failures,
                    last_error: output,
                });
            }
        } else {
            ctl.infra_failures = 0;
        }

        let next = route_after_execution(true, state.iteration_count, self.config.max_retries);
        warn!(
            attempt = state.iteration_count,
            kind = ?kind,
            retrying = next == Stage::CodeGenerate,
            "Execution failed"
        );

        if next == Stage::Done {
            // Out of attempts: the failure itself is the answer
            state.finalize(output.as_str());
            ctl.status = AuditStatus::Exhausted;
        }
        state.last_error = Some(output);
        Ok(next)
    }

    async fn output_gate(
        &self,
        state: &mut RequestState,
        ctl: &mut RunControl,
    ) -> Result<Stage, AuditError> {
        let candidate = ctl.candidate.take().unwrap_or_default();
        if candidate.trim().is_empty() {
            state.finalize(EMPTY_OUTPUT_MESSAGE);
            return Ok(Stage::Done);
        }

        let reply = self
            .call_role(Stage::OutputGate, RoleId::OutputGate, &candidate)
            .await?;

        if is_unsafe_output(&reply) {
            warn!(reply = %reply, "Result withheld by output gate");
            state.finalize(REDACTION_MESSAGE);
        } else {
            state.finalize(reply);
        }
        Ok(Stage::Done)
    }

    // ───────────────────────────────────────────────────────────────────────
    // Role calls
    // ───────────────────────────────────────────────────────────────────────

    async fn call_role(
        &self,
        stage: Stage,
        role: RoleId,
        context: &str,
    ) -> Result<String, AuditError> {
        let timeout = self.config.role_timeout();
        let span = info_span!("role_call", role = %role, otel.name = "role_call");
        let started = Instant::now();

        let outcome = tokio::time::timeout(timeout, self.roles.get(role).invoke(context))
            .instrument(span)
            .await;

        ROLE_CALL_DURATION
            .with_label_values(&[role.as_str()])
            .observe(started.elapsed().as_secs_f64());

        let (status, result) = match outcome {
            Ok(Ok(text)) if text.trim().is_empty() => (
                "empty",
                Err(AuditError::Role { role, source: RoleError::Empty }),
            ),
            Ok(Ok(text)) => ("ok", Ok(text)),
            Ok(Err(source)) => ("error", Err(AuditError::Role { role, source })),
            Err(_) => ("timeout", Err(AuditError::StageTimeout { stage, timeout })),
        };
        ROLE_CALLS.with_label_values(&[role.as_str(), status]).inc();

        if let Err(e) = &result {
            warn!(role = %role, error = %e, "Role call failed");
        }
        result
    }
}
