//! Single-agent tool-calling loop.
//!
//! An [`AgentRuntime`] binds one [`AgentDefinition`] to the shared services
//! and drives it through:
//!
//! ```text
//! Idle → ModelCall → GuardrailCheck → {ToolExecution | AwaitingApproval | Delegating}
//!      → ModelCall … → Finalizing → Done
//! ```
//!
//! `Cancelled` and `Error` are reachable from every non-terminal state.
//! Guardrail blocks and tool failures are fed back to the model as failed
//! tool results. Only loop detection, an exhausted backend retry, the
//! iteration limit, and cancellation end a run early.
//!
//! History is compressed before every model call. Streamed text is checked
//! chunk by chunk and, for blocked patterns, as the accumulated answer, so a
//! pattern split across chunks still blocks the turn. Chunks forwarded before
//! the block stay with the subscriber.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, join_all};
use futures::{FutureExt, StreamExt};
use moco_tools::{ToolDefinition, ToolErrorKind, ToolGateway, ToolResult, validate_arguments};
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agents::{AgentDefinition, AgentRegistry, DELEGATE_TOOL_NAME};
use crate::approval::{ApprovalBroker, ApprovalConfig};
use crate::compressor::ContextCompressor;
use crate::config::RuntimeConfig;
use crate::delegation::{DelegationFrame, DelegationStack};
use crate::error::{AgentError, Result};
use crate::events::{Event, EventSink, ProgressKind, ProgressStatus};
use crate::guardrails::{GuardrailAction, GuardrailPipeline};
use crate::llm::{Message, ModelBackend, ModelChunk, ModelRequest, ModelTurn, Role, ToolCall};
use crate::loop_detector::LoopDetector;

/// Reply substituted when a guardrail blocks model output.
pub const POLICY_VIOLATION_MESSAGE: &str =
    "I can't provide that response because it violates the output policy.";

// ---------------------------------------------------------------------------
// States and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Idle,
    ModelCall,
    GuardrailCheck,
    ToolExecution,
    AwaitingApproval,
    Delegating,
    Finalizing,
    Done,
    Cancelled,
    Error,
}

impl std::fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::ModelCall => "model_call",
            Self::GuardrailCheck => "guardrail_check",
            Self::ToolExecution => "tool_execution",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Delegating => "delegating",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// How an agent run ended.
#[derive(Debug)]
pub struct RunOutcome {
    /// `Done`, `Cancelled` or `Error`.
    pub state: RuntimeState,
    /// The final answer, or the last partial text on error.
    pub text: String,
    pub error: Option<AgentError>,
    /// Model calls made.
    pub iterations: u32,
}

impl RunOutcome {
    pub fn is_done(&self) -> bool {
        self.state == RuntimeState::Done
    }
}

// ---------------------------------------------------------------------------
// Shared services and per-turn context
// ---------------------------------------------------------------------------

/// Everything an agent run needs that outlives a turn. Shared by all
/// sessions.
pub struct RuntimeServices {
    pub backend: Arc<dyn ModelBackend>,
    pub gateway: Arc<ToolGateway>,
    pub guardrails: Arc<GuardrailPipeline>,
    pub compressor: Arc<ContextCompressor>,
    pub loop_detector: Arc<LoopDetector>,
    pub approvals: Arc<ApprovalBroker>,
    pub config: RuntimeConfig,
    pub approval: ApprovalConfig,
}

impl RuntimeServices {
    /// Services with default policy around `backend` and `gateway`.
    pub fn new(backend: Arc<dyn ModelBackend>, gateway: Arc<ToolGateway>) -> Self {
        Self {
            backend,
            gateway,
            guardrails: Arc::new(GuardrailPipeline::default()),
            compressor: Arc::new(ContextCompressor::default()),
            loop_detector: Arc::new(LoopDetector::default()),
            approvals: Arc::new(ApprovalBroker::new()),
            config: RuntimeConfig::default(),
            approval: ApprovalConfig::default(),
        }
    }
}

impl std::fmt::Debug for RuntimeServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeServices")
            .field("gateway", &self.gateway)
            .field("guardrails", &self.guardrails)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// State of one session turn, shared by the session's agent and every
/// agent it delegates to.
#[derive(Debug)]
pub struct TurnContext {
    pub session_id: String,
    /// Registry snapshot taken when the turn started.
    pub agents: Arc<AgentRegistry>,
    pub cancel: CancellationToken,
    pub events: EventSink,
    pub delegation: DelegationStack,
    /// Recall block appended to the session agent's system prompt.
    pub recall: Option<String>,
    sub_sessions: Mutex<HashMap<String, Vec<Message>>>,
    sub_session_limit: usize,
}

impl TurnContext {
    pub fn new(
        session_id: impl Into<String>,
        agents: Arc<AgentRegistry>,
        cancel: CancellationToken,
        events: EventSink,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            agents,
            cancel,
            events,
            delegation: DelegationStack::new(config.max_delegation_depth),
            recall: None,
            sub_sessions: Mutex::new(HashMap::new()),
            sub_session_limit: config.sub_session_history,
        }
    }

    /// Seed the delegate histories carried over from earlier turns.
    pub fn with_sub_sessions(self, sub_sessions: HashMap<String, Vec<Message>>) -> Self {
        *self.sub_sessions_lock() = sub_sessions;
        self
    }

    pub fn with_recall(mut self, recall: Option<String>) -> Self {
        self.recall = recall;
        self
    }

    /// Hand the delegate histories back to the session.
    pub fn into_sub_sessions(self) -> HashMap<String, Vec<Message>> {
        self.sub_sessions
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn sub_sessions_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Message>>> {
        self.sub_sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The delegate's recent history, never starting on a tool result.
    fn take_sub_history(&self, agent: &str) -> Vec<Message> {
        let mut history = self.sub_sessions_lock().remove(agent).unwrap_or_default();
        let mut start = history.len().saturating_sub(self.sub_session_limit);
        while start < history.len() && history[start].role == Role::Tool {
            start += 1;
        }
        history.drain(..start);
        history
    }

    fn store_sub_history(&self, agent: &str, history: Vec<Message>) {
        self.sub_sessions_lock().insert(agent.to_owned(), history);
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// One agent bound to the shared services at a given delegation depth.
#[derive(Debug, Clone)]
pub struct AgentRuntime {
    definition: Arc<AgentDefinition>,
    services: Arc<RuntimeServices>,
    depth: u32,
}

/// What the model streamed back for one call.
enum Streamed {
    Turn(ModelTurn),
    /// Output guardrail blocked the response.
    Blocked,
}

/// Result of checking one proposed call before execution.
enum Precheck {
    Ready(ToolCall),
    Rejected(ToolResult),
    Loop,
}

impl AgentRuntime {
    pub fn new(definition: Arc<AgentDefinition>, services: Arc<RuntimeServices>, depth: u32) -> Self {
        Self {
            definition,
            services,
            depth,
        }
    }

    pub fn definition(&self) -> &AgentDefinition {
        &self.definition
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Drive the agent until it answers, fails, or is cancelled.
    ///
    /// `history` must end with the message to respond to. Every message the
    /// run produces, including failed tool results, is appended to it.
    pub fn run<'a>(
        &'a self,
        turn: &'a TurnContext,
        history: &'a mut Vec<Message>,
    ) -> BoxFuture<'a, RunOutcome> {
        async move {
            info!(
                session_id = %turn.session_id,
                agent = %self.definition.name,
                depth = self.depth,
                "agent run started"
            );
            self.transition(RuntimeState::Idle);

            let mut iterations = 0u32;
            let mut partial = String::new();
            let result = self
                .run_loop(turn, history, &mut iterations, &mut partial)
                .await;

            let outcome = match result {
                Ok(text) => {
                    self.transition(RuntimeState::Done);
                    RunOutcome {
                        state: RuntimeState::Done,
                        text,
                        error: None,
                        iterations,
                    }
                }
                Err(AgentError::Cancelled) => {
                    self.transition(RuntimeState::Cancelled);
                    RunOutcome {
                        state: RuntimeState::Cancelled,
                        text: partial,
                        error: Some(AgentError::Cancelled),
                        iterations,
                    }
                }
                Err(e) => {
                    warn!(agent = %self.definition.name, depth = self.depth, error = %e, "agent run failed");
                    self.transition(RuntimeState::Error);
                    RunOutcome {
                        state: RuntimeState::Error,
                        text: partial,
                        error: Some(e),
                        iterations,
                    }
                }
            };
            info!(
                session_id = %turn.session_id,
                agent = %self.definition.name,
                depth = self.depth,
                state = %outcome.state,
                iterations = outcome.iterations,
                "agent run finished"
            );
            outcome
        }
        .boxed()
    }

    async fn run_loop(
        &self,
        turn: &TurnContext,
        history: &mut Vec<Message>,
        iterations: &mut u32,
        partial: &mut String,
    ) -> Result<String> {
        let scope = self.loop_scope(turn);
        let tools = self.tool_definitions().await;
        let system_prompt = self.system_prompt(turn);
        let mut calls_this_turn = 0usize;

        while *iterations < self.services.config.max_iterations {
            *iterations += 1;

            // The request always carries the compressed history, on the
            // first call of a turn as well as after each tool round.
            let (compressed, was_compressed) = tokio::select! {
                biased;
                _ = turn.cancel.cancelled() => return Err(AgentError::Cancelled),
                r = self
                    .services
                    .compressor
                    .compress_if_needed(history, self.services.backend.as_ref()) => r,
            };
            if was_compressed {
                *history = compressed;
            }

            self.transition(RuntimeState::ModelCall);

            let model_turn = match self.call_model(turn, &system_prompt, history, &tools).await? {
                Streamed::Turn(model_turn) => model_turn,
                Streamed::Blocked => {
                    history.push(Message::assistant(POLICY_VIOLATION_MESSAGE));
                    return Ok(POLICY_VIOLATION_MESSAGE.to_owned());
                }
            };
            if !model_turn.text.is_empty() {
                partial.clone_from(&model_turn.text);
            }

            if model_turn.is_final() {
                self.transition(RuntimeState::Finalizing);
                history.push(Message::assistant(model_turn.text.clone()));
                return Ok(model_turn.text);
            }

            let calls = model_turn.tool_calls;
            history.push(Message::assistant_tool_calls(model_turn.text, calls.clone()));

            // -- checks, in proposal order --------------------------------
            self.transition(RuntimeState::GuardrailCheck);
            let mut slots: Vec<Option<ToolResult>> = vec![None; calls.len()];
            let mut runnable = Vec::new();
            for (i, call) in calls.iter().enumerate() {
                let check = self.precheck(&scope, call, calls_this_turn).await;
                calls_this_turn += 1;
                match check {
                    Precheck::Ready(call) => runnable.push((i, call)),
                    Precheck::Rejected(result) => slots[i] = Some(result),
                    Precheck::Loop => {
                        for (j, other) in calls.iter().enumerate() {
                            let result = if j == i {
                                ToolResult::failure(
                                    &other.id,
                                    ToolErrorKind::LoopDetected,
                                    format!(
                                        "Blocked: `{}` was called repeatedly with the same arguments",
                                        other.name
                                    ),
                                )
                            } else {
                                ToolResult::failure(
                                    &other.id,
                                    ToolErrorKind::Cancelled,
                                    "Not executed: the turn was aborted",
                                )
                            };
                            if slots[j].is_none() || j == i {
                                slots[j] = Some(result);
                            }
                        }
                        append_results(history, slots);
                        return Err(AgentError::LoopDetected {
                            tool_name: call.name.clone(),
                            count: self.services.loop_detector.repeat_threshold(),
                        });
                    }
                }
            }

            // -- execution ------------------------------------------------
            self.transition(RuntimeState::ToolExecution);
            let parallel = model_turn.parallel && runnable.len() > 1;
            for (i, result) in self.execute_all(turn, runnable, parallel).await? {
                slots[i] = Some(result);
            }
            append_results(history, slots);
        }

        Err(AgentError::MaxIterations {
            agent: self.definition.name.clone(),
            max_iterations: self.services.config.max_iterations,
        })
    }

    // -- model -------------------------------------------------------------

    /// One model call with a single retry on transport errors.
    async fn call_model(
        &self,
        turn: &TurnContext,
        system_prompt: &str,
        history: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<Streamed> {
        let mut retried = false;
        loop {
            let mut forwarded = false;
            match self
                .stream_once(turn, system_prompt, history, tools, &mut forwarded)
                .await
            {
                // Chunks already sent cannot be taken back, so a stream that
                // failed after forwarding text is not retried.
                Err(AgentError::BackendTransport { reason }) if !retried && !forwarded => {
                    retried = true;
                    warn!(
                        agent = %self.definition.name,
                        reason = %reason,
                        "model backend failed, retrying once"
                    );
                    tokio::select! {
                        biased;
                        _ = turn.cancel.cancelled() => return Err(AgentError::Cancelled),
                        _ = tokio::time::sleep(self.services.config.retry_backoff()) => {}
                    }
                }
                other => return other,
            }
        }
    }

    async fn stream_once(
        &self,
        turn: &TurnContext,
        system_prompt: &str,
        history: &[Message],
        tools: &[ToolDefinition],
        forwarded: &mut bool,
    ) -> Result<Streamed> {
        let request = ModelRequest {
            system_prompt: system_prompt.to_owned(),
            messages: history.to_vec(),
            tools: tools.to_vec(),
            agent: self.definition.name.clone(),
        };
        let mut stream = tokio::select! {
            biased;
            _ = turn.cancel.cancelled() => return Err(AgentError::Cancelled),
            stream = self.services.backend.generate(request) => stream?,
        };

        // Only the session's agent streams text to the subscriber; delegates
        // report through progress events.
        let forward = self.depth == 0;
        let mut model_turn = ModelTurn::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = turn.cancel.cancelled() => return Err(AgentError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            match chunk? {
                ModelChunk::Text(mut text) => {
                    let verdict = self.services.guardrails.validate_output(&text);
                    match verdict.action {
                        GuardrailAction::Block => return Ok(Streamed::Blocked),
                        GuardrailAction::Modify => {
                            if let Some(content) = verdict.modified_content {
                                text = content;
                            }
                        }
                        GuardrailAction::Allow | GuardrailAction::Warn => {}
                    }
                    model_turn.text.push_str(&text);
                    if self
                        .services
                        .guardrails
                        .matches_blocked_pattern(&model_turn.text)
                    {
                        return Ok(Streamed::Blocked);
                    }
                    if forward {
                        *forwarded = true;
                        turn.events
                            .emit(Event::Chunk {
                                content: text.clone(),
                            })
                            .await;
                    }
                }
                ModelChunk::Thinking(text) => {
                    if forward {
                        *forwarded = true;
                        turn.events
                            .emit(Event::Thinking {
                                content: text.clone(),
                            })
                            .await;
                    }
                    model_turn.thinking.push_str(&text);
                }
                ModelChunk::ToolCall(mut call) => {
                    if call.id.is_empty() {
                        call.id = format!("call_{}", uuid::Uuid::now_v7().simple());
                    }
                    call.agent.clone_from(&self.definition.name);
                    call.depth = self.depth;
                    model_turn.tool_calls.push(call);
                }
                ModelChunk::ParallelToolCalls => model_turn.parallel = true,
            }
        }
        debug!(
            agent = %self.definition.name,
            text_len = model_turn.text.len(),
            tool_calls = model_turn.tool_calls.len(),
            parallel = model_turn.parallel,
            "model turn received"
        );
        Ok(Streamed::Turn(model_turn))
    }

    // -- tool calls --------------------------------------------------------

    async fn precheck(&self, scope: &str, call: &ToolCall, calls_this_turn: usize) -> Precheck {
        let mut call = call.clone();

        let verdict =
            self.services
                .guardrails
                .validate_tool_call(&call.name, &call.arguments, calls_this_turn);
        match verdict.action {
            GuardrailAction::Block => {
                return Precheck::Rejected(ToolResult::failure(
                    &call.id,
                    ToolErrorKind::Blocked,
                    format!("Blocked: {}", verdict.message),
                ));
            }
            GuardrailAction::Modify => {
                if let Some(args) = verdict
                    .modified_content
                    .and_then(|c| serde_json::from_str::<Value>(&c).ok())
                    .filter(Value::is_object)
                {
                    call.arguments = args;
                }
            }
            GuardrailAction::Warn | GuardrailAction::Allow => {}
        }

        let validation = if call.name == DELEGATE_TOOL_NAME && self.definition.can_delegate {
            validate_arguments(&delegate_tool_definition(), &call.arguments)
        } else if !self.definition.allows_tool(&call.name)
            || !self.services.gateway.has_tool(&call.name).await
        {
            return Precheck::Rejected(ToolResult::failure(
                &call.id,
                ToolErrorKind::NotFound,
                format!(
                    "Error: tool `{}` is not available to agent `{}`",
                    call.name, self.definition.name
                ),
            ));
        } else {
            self.services.gateway.validate(&call.name, &call.arguments)
        };
        if let Err(e) = validation {
            return Precheck::Rejected(ToolResult::from_error(&call.id, &e));
        }

        if self
            .services
            .loop_detector
            .check(scope, &call.name, &call.arguments)
        {
            return Precheck::Loop;
        }
        Precheck::Ready(call)
    }

    /// Run the checked calls, returning results tagged with their slot.
    async fn execute_all(
        &self,
        turn: &TurnContext,
        runnable: Vec<(usize, ToolCall)>,
        parallel: bool,
    ) -> Result<Vec<(usize, ToolResult)>> {
        if parallel {
            let permits = Semaphore::new(self.services.config.max_parallel_tools);
            let permits = &permits;
            let batch = runnable.into_iter().map(|(i, call)| async move {
                let _permit = permits.acquire().await.ok();
                (i, self.execute(turn, call).await)
            });
            debug!(agent = %self.definition.name, "executing tool calls in parallel");
            return tokio::select! {
                biased;
                _ = turn.cancel.cancelled() => Err(AgentError::Cancelled),
                results = join_all(batch) => Ok(results),
            };
        }

        let mut results = Vec::with_capacity(runnable.len());
        for (i, call) in runnable {
            let result = tokio::select! {
                biased;
                _ = turn.cancel.cancelled() => return Err(AgentError::Cancelled),
                result = self.execute(turn, call) => result,
            };
            results.push((i, result));
        }
        Ok(results)
    }

    async fn execute(&self, turn: &TurnContext, call: ToolCall) -> ToolResult {
        if call.name == DELEGATE_TOOL_NAME {
            return self.delegate(turn, &call).await;
        }

        if self.services.approval.requires_approval(&call.name) {
            self.transition(RuntimeState::AwaitingApproval);
            let approvals = &self.services.approvals;
            let (request, rx) = approvals.open(&turn.session_id, &call.name, call.arguments.clone());
            turn.events
                .emit(Event::Approval {
                    id: request.id.clone(),
                    tool: request.tool.clone(),
                    args: request.args.clone(),
                })
                .await;
            let approved = approvals
                .wait(&request.id, rx, self.services.approval.timeout())
                .await;
            if !approved {
                return ToolResult::failure(
                    &call.id,
                    ToolErrorKind::Rejected,
                    format!("Rejected: running `{}` was not approved", call.name),
                );
            }
        }

        turn.events
            .progress(
                ProgressKind::Tool,
                &call.name,
                ProgressStatus::Running,
                brief(&call.arguments.to_string()),
            )
            .await;
        let result = self
            .services
            .gateway
            .invoke(
                &call.id,
                &call.name,
                call.arguments,
                Some(self.services.config.tool_timeout()),
            )
            .await;
        let detail = if result.success { "ok" } else { "failed" };
        turn.events
            .progress(ProgressKind::Tool, &call.name, ProgressStatus::Completed, detail)
            .await;
        result
    }

    /// Run `agent_name` on `task` as a child of this agent.
    pub async fn delegate_task(&self, turn: &TurnContext, agent_name: &str, task: &str) -> ToolResult {
        let call = ToolCall::new(
            format!("call_{}", uuid::Uuid::now_v7().simple()),
            DELEGATE_TOOL_NAME,
            json!({"agent_name": agent_name, "task": task}),
        );
        self.delegate(turn, &call).await
    }

    async fn delegate(&self, turn: &TurnContext, call: &ToolCall) -> ToolResult {
        let agent_name = call.arguments["agent_name"].as_str().unwrap_or_default();
        let task = call.arguments["task"].as_str().unwrap_or_default();

        let frame = DelegationFrame {
            parent_session: turn.session_id.clone(),
            parent_agent: self.definition.name.clone(),
            child_agent: agent_name.to_owned(),
            task: task.to_owned(),
            depth: self.depth + 1,
        };
        let _frame = match turn.delegation.push(frame) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(
                    agent = %self.definition.name,
                    target = agent_name,
                    depth = self.depth + 1,
                    "delegation refused: depth limit"
                );
                return ToolResult::failure(
                    &call.id,
                    ToolErrorKind::DepthExceeded,
                    format!("Blocked: {e}"),
                );
            }
        };

        let Some(definition) = turn.agents.get(agent_name) else {
            return ToolResult::failure(
                &call.id,
                ToolErrorKind::NotFound,
                format!(
                    "Error: agent `{agent_name}` not found. Available agents: {}",
                    turn.agents.names().join(", ")
                ),
            );
        };

        self.transition(RuntimeState::Delegating);
        turn.events
            .progress(ProgressKind::Delegate, agent_name, ProgressStatus::Running, brief(task))
            .await;

        let child = AgentRuntime::new(definition, self.services.clone(), self.depth + 1);
        let mut child_history = turn.take_sub_history(agent_name);
        child_history.push(Message::user(task));
        let outcome = child.run(turn, &mut child_history).await;
        turn.store_sub_history(agent_name, child_history);

        turn.events
            .progress(
                ProgressKind::Delegate,
                agent_name,
                ProgressStatus::Completed,
                outcome.state.to_string(),
            )
            .await;

        match (outcome.state, outcome.error) {
            (RuntimeState::Done, _) => ToolResult::ok(&call.id, outcome.text),
            (RuntimeState::Cancelled, _) => {
                ToolResult::failure(&call.id, ToolErrorKind::Cancelled, "Cancelled")
            }
            (_, error) => ToolResult::failure(
                &call.id,
                ToolErrorKind::Execution,
                format!(
                    "Error: agent `{agent_name}` failed: {}",
                    error.map(|e| e.to_string()).unwrap_or_default()
                ),
            ),
        }
    }

    // -- helpers -----------------------------------------------------------

    fn transition(&self, state: RuntimeState) {
        debug!(agent = %self.definition.name, depth = self.depth, state = %state, "state transition");
    }

    fn loop_scope(&self, turn: &TurnContext) -> String {
        format!("{}/{}@{}", turn.session_id, self.definition.name, self.depth)
    }

    fn system_prompt(&self, turn: &TurnContext) -> String {
        let mut prompt = self.definition.system_prompt.clone();
        if self.definition.can_delegate {
            let others: Vec<String> = turn
                .agents
                .definitions()
                .filter(|a| a.name != self.definition.name)
                .map(|a| format!("- {}: {}", a.name, a.description))
                .collect();
            if !others.is_empty() {
                prompt.push_str("\n\nAgents available through `delegate_to_agent`:\n");
                prompt.push_str(&others.join("\n"));
            }
        }
        if self.depth == 0 {
            if let Some(recall) = &turn.recall {
                prompt.push_str("\n\n");
                prompt.push_str(recall);
            }
        }
        prompt
    }

    async fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut tools: Vec<ToolDefinition> = self
            .services
            .gateway
            .definitions()
            .await
            .into_iter()
            .filter(|t| self.definition.allows_tool(&t.name))
            .collect();
        if self.definition.can_delegate {
            tools.push(delegate_tool_definition());
        }
        tools
    }
}

/// Schema of the built-in delegation tool.
pub fn delegate_tool_definition() -> ToolDefinition {
    ToolDefinition::new(
        DELEGATE_TOOL_NAME,
        "Hand a sub-task to another agent and wait for its answer.",
        json!({
            "type": "object",
            "properties": {
                "agent_name": {"type": "string", "description": "Agent to delegate to"},
                "task": {"type": "string", "description": "What the agent should do"}
            },
            "required": ["agent_name", "task"]
        }),
    )
}

fn append_results(history: &mut Vec<Message>, slots: Vec<Option<ToolResult>>) {
    history.extend(slots.iter().flatten().map(Message::tool_result));
}

/// First line of `text`, cut to 120 characters for progress details.
fn brief(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    let mut out: String = line.chars().take(120).collect();
    if out.len() < text.len() {
        out.push('…');
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
