//! Session management and turn dispatch.
//!
//! The [`Orchestrator`] owns every session. A turn takes the session's turn
//! lock, validates the input, picks the agent, runs it on a snapshot of the
//! history, and commits the result. Turns of different sessions run fully
//! in parallel; turns of one session queue on its lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use moco_store::{Checkpoint, CheckpointStore, should_auto_save};
use moco_tools::{ToolErrorKind, ToolGateway, ToolResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agents::{AgentDefinition, AgentMode, AgentRegistry, ORCHESTRATOR_AGENT};
use crate::approval::{ApprovalBroker, ApprovalRequest};
use crate::cancellation::CancelRegistry;
use crate::compressor::{ContextCompressor, TokenEstimator};
use crate::config::MocoConfig;
use crate::error::{AgentError, Result};
use crate::events::{Event, EventSink};
use crate::guardrails::{GuardrailAction, GuardrailPipeline};
use crate::llm::{Message, ModelBackend, Role};
use crate::loop_detector::LoopDetector;
use crate::memory::{MemoryStore, recall_context};
use crate::runtime::{AgentRuntime, RunOutcome, RuntimeServices, RuntimeState, TurnContext};

/// `@agent-name rest of the message`.
const ROUTING_PATTERN: &str = r"^@([\w-]+)[:\s]*(.*)";

/// Hits requested from the memory store per turn.
const RECALL_TOP_K: usize = 3;

const DEFAULT_ORCHESTRATOR_PROMPT: &str = "You are the orchestrator. Answer directly when you can, \
and delegate focused sub-tasks to the most suitable agent when that helps.";

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// A point-in-time copy of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub profile: String,
    pub active_agent: String,
    pub messages: Vec<Message>,
    pub turn_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Session listing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub title: String,
    pub profile: String,
    pub active_agent: String,
    pub message_count: usize,
    pub turn_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct SessionState {
    title: String,
    profile: String,
    active_agent: String,
    messages: Vec<Message>,
    turn_count: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    /// Per-delegate histories, keyed by agent name.
    sub_sessions: HashMap<String, Vec<Message>>,
}

struct SessionHandle {
    id: String,
    /// Held for the whole turn: one turn per session at a time.
    turn_lock: Mutex<()>,
    state: RwLock<SessionState>,
}

impl SessionHandle {
    fn new(id: String, state: SessionState) -> Self {
        Self {
            id,
            turn_lock: Mutex::new(()),
            state: RwLock::new(state),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self) -> Session {
        let s = self.read();
        Session {
            id: self.id.clone(),
            title: s.title.clone(),
            profile: s.profile.clone(),
            active_agent: s.active_agent.clone(),
            messages: s.messages.clone(),
            turn_count: s.turn_count,
            created_at: s.created_at,
            updated_at: s.updated_at,
        }
    }

    fn info(&self) -> SessionInfo {
        let s = self.read();
        SessionInfo {
            id: self.id.clone(),
            title: s.title.clone(),
            profile: s.profile.clone(),
            active_agent: s.active_agent.clone(),
            message_count: s.messages.len(),
            turn_count: s.turn_count,
            created_at: s.created_at,
            updated_at: s.updated_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles an [`Orchestrator`] from configuration and collaborators.
pub struct OrchestratorBuilder {
    config: MocoConfig,
    backend: Arc<dyn ModelBackend>,
    gateway: Option<Arc<ToolGateway>>,
    agents: Option<AgentRegistry>,
    checkpoints: Option<CheckpointStore>,
    memory: Option<Arc<dyn MemoryStore>>,
    estimator: Option<Arc<dyn TokenEstimator>>,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: MocoConfig) -> Self {
        self.config = config;
        self
    }

    pub fn gateway(mut self, gateway: Arc<ToolGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Use these agents instead of loading `agents_dir`.
    pub fn agents(mut self, agents: AgentRegistry) -> Self {
        self.agents = Some(agents);
        self
    }

    pub fn checkpoints(mut self, store: CheckpointStore) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn token_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let config = self.config;
        config.validate()?;

        let mut agents = match (self.agents, &config.agents_dir) {
            (Some(agents), _) => agents,
            (None, Some(dir)) => AgentRegistry::load_dir(dir)?,
            (None, None) => AgentRegistry::new(),
        };
        if agents.is_empty() {
            agents.insert(
                AgentDefinition::new(ORCHESTRATOR_AGENT, DEFAULT_ORCHESTRATOR_PROMPT)
                    .with_description("Routes work to the right agent"),
            );
        }

        let mut compressor = ContextCompressor::new(config.compression.clone());
        if let Some(estimator) = self.estimator {
            compressor = compressor.with_estimator(estimator);
        }

        let services = RuntimeServices {
            backend: self.backend,
            gateway: self.gateway.unwrap_or_default(),
            guardrails: Arc::new(GuardrailPipeline::new(&config.guardrails)?),
            compressor: Arc::new(compressor),
            loop_detector: Arc::new(LoopDetector::new(config.loop_detection.clone())),
            approvals: Arc::new(ApprovalBroker::new()),
            config: config.runtime.clone(),
            approval: config.approval.clone(),
        };

        let routing = Regex::new(&format!("(?s){ROUTING_PATTERN}")).map_err(|e| {
            AgentError::Internal(format!("routing pattern failed to compile: {e}"))
        })?;

        info!(
            agents = agents.len(),
            checkpoints = self.checkpoints.is_some(),
            memory = self.memory.is_some(),
            "orchestrator ready"
        );

        Ok(Orchestrator {
            config,
            services: Arc::new(services),
            agents: RwLock::new(Arc::new(agents)),
            checkpoints: self.checkpoints,
            memory: self.memory,
            sessions: DashMap::new(),
            cancels: CancelRegistry::new(),
            routing,
        })
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    config: MocoConfig,
    services: Arc<RuntimeServices>,
    agents: RwLock<Arc<AgentRegistry>>,
    checkpoints: Option<CheckpointStore>,
    memory: Option<Arc<dyn MemoryStore>>,
    sessions: DashMap<String, Arc<SessionHandle>>,
    cancels: CancelRegistry,
    routing: Regex,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("sessions", &self.sessions.len())
            .field("agents", &self.agents().names())
            .field("checkpoints", &self.checkpoints.is_some())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn builder(backend: Arc<dyn ModelBackend>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config: MocoConfig::default(),
            backend,
            gateway: None,
            agents: None,
            checkpoints: None,
            memory: None,
            estimator: None,
        }
    }

    pub fn config(&self) -> &MocoConfig {
        &self.config
    }

    /// The shared guardrail policy, for admin changes at runtime.
    pub fn guardrails(&self) -> &Arc<GuardrailPipeline> {
        &self.services.guardrails
    }

    pub fn gateway(&self) -> &Arc<ToolGateway> {
        &self.services.gateway
    }

    /// Snapshot of the current agent registry.
    pub fn agents(&self) -> Arc<AgentRegistry> {
        self.agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // -- agents --------------------------------------------------------------

    /// Re-read `agents_dir`. Running turns keep the registry they started
    /// with; the next turn sees the new one.
    pub fn reload_agents(&self) -> Result<usize> {
        let dir = self
            .config
            .agents_dir
            .as_deref()
            .ok_or_else(|| AgentError::ConfigError {
                reason: "no agents_dir configured".into(),
            })?;
        let registry = AgentRegistry::load_dir(dir)?;
        let count = registry.len();
        self.set_agents(registry);
        Ok(count)
    }

    /// Swap in a new registry.
    pub fn set_agents(&self, registry: AgentRegistry) {
        let count = registry.len();
        *self.agents.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(registry);
        info!(agents = count, "agent registry replaced");
    }

    // -- sessions ------------------------------------------------------------

    /// Start a session owned by the configured default agent.
    pub fn create_session(&self, title: &str, profile: Option<&str>) -> Result<String> {
        let agents = self.agents();
        let agent = agents
            .default_agent(self.config.default_agent.as_deref())
            .ok_or_else(|| AgentError::AgentNotFound {
                agent: self
                    .config
                    .default_agent
                    .clone()
                    .unwrap_or_else(|| ORCHESTRATOR_AGENT.to_owned()),
            })?;

        let id = format!("sess_{}", uuid::Uuid::now_v7().simple());
        let now = Utc::now();
        let state = SessionState {
            title: title.to_owned(),
            profile: profile.unwrap_or("default").to_owned(),
            active_agent: agent.name.clone(),
            messages: Vec::new(),
            turn_count: 0,
            created_at: now,
            updated_at: now,
            sub_sessions: HashMap::new(),
        };
        self.sessions
            .insert(id.clone(), Arc::new(SessionHandle::new(id.clone(), state)));
        info!(session_id = %id, agent = %agent.name, "session created");
        Ok(id)
    }

    /// Resume an existing session.
    pub fn continue_session(&self, session_id: &str) -> Result<Session> {
        self.get_session(session_id)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Session> {
        Ok(self.handle(session_id)?.snapshot())
    }

    pub fn get_session_history(&self, session_id: &str) -> Result<Vec<Message>> {
        Ok(self.handle(session_id)?.read().messages.clone())
    }

    /// All sessions, oldest first.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|s| s.value().info()).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sessions
    }

    /// Point the session at another agent for its next turns.
    pub fn set_active_agent(&self, session_id: &str, agent: &str) -> Result<()> {
        let handle = self.handle(session_id)?;
        if !self.agents().contains(agent) {
            return Err(AgentError::AgentNotFound {
                agent: agent.to_owned(),
            });
        }
        handle.write().active_agent = agent.to_owned();
        Ok(())
    }

    /// Remove a session and its checkpoints. Returns the number of
    /// checkpoints deleted.
    pub async fn delete_session(&self, session_id: &str) -> Result<usize> {
        let (_, handle) =
            self.sessions
                .remove(session_id)
                .ok_or_else(|| AgentError::SessionNotFound {
                    session_id: session_id.to_owned(),
                })?;
        self.cancel(session_id);
        // Wait for a running turn to unwind before dropping its state.
        let _turn = handle.turn_lock.lock().await;
        self.services
            .loop_detector
            .reset(&format!("{session_id}/"));
        let removed = match &self.checkpoints {
            Some(store) => store.delete_session(session_id).await?,
            None => 0,
        };
        info!(session_id, checkpoints = removed, "session deleted");
        Ok(removed)
    }

    /// Cancel the session's running turn. Returns false when none is running.
    pub fn cancel(&self, session_id: &str) -> bool {
        self.services.approvals.cancel_session(session_id);
        self.cancels.request_cancel(session_id)
    }

    // -- approvals -----------------------------------------------------------

    pub fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.services.approvals.pending()
    }

    pub fn respond_approval(&self, approval_id: &str, approved: bool) -> bool {
        self.services.approvals.respond(approval_id, approved)
    }

    // -- turns ---------------------------------------------------------------

    /// Process one message and return the final answer.
    pub async fn process_message(&self, text: &str, session_id: &str) -> Result<String> {
        let handle = self.handle(session_id)?;
        let cancel = self.cancels.create(&handle.id);
        self.handle_turn(&handle, text, cancel, &EventSink::discard())
            .await
    }

    /// Process one message in the background, streaming its events.
    ///
    /// The stream always ends with `done`, `cancelled` or `error`.
    pub fn run(self: &Arc<Self>, text: &str, session_id: &str) -> Result<mpsc::Receiver<Event>> {
        let handle = self.handle(session_id)?;
        let (sink, rx) = EventSink::channel(self.config.runtime.event_channel_capacity);
        // Registered before the task runs so an immediate cancel reaches it.
        let cancel = self.cancels.create(&handle.id);
        let this = Arc::clone(self);
        let text = text.to_owned();
        tokio::spawn(async move {
            let _ = this.handle_turn(&handle, &text, cancel, &sink).await;
        });
        Ok(rx)
    }

    /// Run one turn under the session lock. `cancel` was taken from the
    /// registry when the turn was submitted and is released here.
    async fn handle_turn(
        &self,
        handle: &SessionHandle,
        text: &str,
        cancel: CancellationToken,
        sink: &EventSink,
    ) -> Result<String> {
        let _turn = handle.turn_lock.lock().await;
        sink.emit(Event::Start {
            session_id: handle.id.clone(),
        })
        .await;

        let result = self.turn(handle, text, &cancel, sink).await;
        self.cancels.clear(&handle.id);

        match &result {
            Ok(_) => sink.emit(Event::Done {}).await,
            Err(AgentError::Cancelled) => sink.emit(Event::Cancelled {}).await,
            Err(e) => {
                sink.emit(Event::Error {
                    message: e.to_string(),
                })
                .await
            }
        }
        result
    }

    async fn turn(
        &self,
        handle: &SessionHandle,
        text: &str,
        cancel: &CancellationToken,
        sink: &EventSink,
    ) -> Result<String> {
        let verdict = self.services.guardrails.validate_input(text);
        let text = match verdict.action {
            GuardrailAction::Block => {
                return Err(AgentError::ValidationBlocked {
                    reason: verdict.message,
                });
            }
            GuardrailAction::Modify => verdict.modified_content.unwrap_or_else(|| text.to_owned()),
            GuardrailAction::Warn | GuardrailAction::Allow => text.to_owned(),
        };

        let agents = self.agents();
        let (agent, text) = self.route(handle, &agents, text)?;

        let estimate = self
            .services
            .compressor
            .estimate_tokens(&[Message::user(text.as_str())]);
        let (mut history, sub_sessions) = {
            let mut state = handle.write();
            state
                .messages
                .push(Message::user(text.as_str()).with_token_estimate(estimate));
            state.updated_at = Utc::now();
            (state.messages.clone(), std::mem::take(&mut state.sub_sessions))
        };
        self.services
            .loop_detector
            .reset(&format!("{}/", handle.id));

        let recall = self.recall(&text, sink).await;

        let ctx = TurnContext::new(
            handle.id.clone(),
            agents.clone(),
            cancel.clone(),
            sink.clone(),
            &self.config.runtime,
        )
        .with_sub_sessions(sub_sessions)
        .with_recall(recall);
        let runtime = AgentRuntime::new(agent.clone(), self.services.clone(), 0);
        let mut outcome = runtime.run(&ctx, &mut history).await;

        if outcome.is_done() && agent.can_delegate && agent.mode == AgentMode::Primary {
            self.run_inline_delegations(&runtime, &ctx, &agents, &mut outcome, &mut history)
                .await;
        }
        if !outcome.is_done() {
            close_dangling_calls(&mut history);
            if outcome.state == RuntimeState::Error && !outcome.text.is_empty() {
                save_partial(&mut history, &outcome.text);
            }
        }

        let sub_sessions = ctx.into_sub_sessions();
        let (turn_count, title) = {
            let mut state = handle.write();
            state.messages = history;
            state.sub_sessions = sub_sessions;
            if outcome.state != RuntimeState::Cancelled {
                state.turn_count += 1;
            }
            state.updated_at = Utc::now();
            (state.turn_count, state.title.clone())
        };

        if outcome.state != RuntimeState::Cancelled {
            self.auto_save(handle, turn_count, &agent.name, &title).await;
        }

        match outcome.state {
            RuntimeState::Done if agent.name == ORCHESTRATOR_AGENT => Ok(outcome.text),
            RuntimeState::Done => Ok(format!("@{}: {}", agent.name, outcome.text)),
            RuntimeState::Cancelled => Err(AgentError::Cancelled),
            _ => Err(outcome
                .error
                .unwrap_or_else(|| AgentError::Internal("agent run failed".into()))),
        }
    }

    /// Resolve `@agent` routing. Unknown names leave the text untouched.
    fn route(
        &self,
        handle: &SessionHandle,
        agents: &AgentRegistry,
        text: String,
    ) -> Result<(Arc<AgentDefinition>, String)> {
        if let Some(caps) = self.routing.captures(text.trim_start()) {
            let name = &caps[1];
            if let Some(agent) = agents.get(name) {
                let rest = caps[2].trim().to_owned();
                debug!(session_id = %handle.id, agent = name, "message routed by mention");
                return Ok((agent, rest));
            }
        }

        let active = handle.read().active_agent.clone();
        let agent = agents
            .get(&active)
            .or_else(|| agents.default_agent(self.config.default_agent.as_deref()))
            .ok_or(AgentError::AgentNotFound { agent: active })?;
        Ok((agent, text))
    }

    async fn recall(&self, text: &str, sink: &EventSink) -> Option<String> {
        let memory = self.memory.as_ref()?;
        match memory.search(text, RECALL_TOP_K).await {
            Ok(hits) if !hits.is_empty() => {
                let context = recall_context(&hits);
                sink.emit(Event::Recall { hits }).await;
                context
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "memory recall failed, continuing without it");
                None
            }
        }
    }

    /// Run `@agent task` lines of a final answer as parallel delegations
    /// and append their results.
    async fn run_inline_delegations(
        &self,
        runtime: &AgentRuntime,
        ctx: &TurnContext,
        agents: &AgentRegistry,
        outcome: &mut RunOutcome,
        history: &mut [Message],
    ) {
        let self_name = runtime.definition().name.as_str();
        let tasks: Vec<(String, String)> = outcome
            .text
            .lines()
            .filter_map(|line| {
                let caps = self.routing.captures(line.trim())?;
                let name = &caps[1];
                let task = caps[2].trim();
                (name != self_name && agents.contains(name) && !task.is_empty())
                    .then(|| (name.to_owned(), task.to_owned()))
            })
            .collect();
        if tasks.is_empty() {
            return;
        }

        info!(session_id = %ctx.session_id, count = tasks.len(), "running inline delegations");
        let results: Vec<ToolResult> = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return,
            results = join_all(
                tasks
                    .iter()
                    .map(|(agent, task)| runtime.delegate_task(ctx, agent, task)),
            ) => results,
        };

        for ((agent, _), result) in tasks.iter().zip(results) {
            outcome.text.push_str(&format!("\n\n@{agent}: {}", result.content));
        }
        if let Some(last) = history.last_mut().filter(|m| m.role == Role::Assistant) {
            last.content.clone_from(&outcome.text);
        }
    }

    async fn auto_save(&self, handle: &SessionHandle, turn_count: u64, agent: &str, title: &str) {
        let Some(store) = &self.checkpoints else {
            return;
        };
        let checkpoint = &self.config.checkpoint;
        if !checkpoint.enabled || !should_auto_save(turn_count, checkpoint.auto_save_interval) {
            return;
        }
        let messages = handle.read().messages.clone();
        let metadata = metadata(json!({
            "turn_count": turn_count,
            "agent": agent,
            "title": title,
            "auto": true,
        }));
        match store
            .save(&handle.id, &messages, &format!("Auto-save after turn {turn_count}"), metadata)
            .await
        {
            Ok(cp) => debug!(session_id = %handle.id, checkpoint_id = %cp.id, "auto-saved checkpoint"),
            Err(e) => warn!(session_id = %handle.id, error = %e, "auto-save failed"),
        }
    }

    // -- checkpoints ---------------------------------------------------------

    fn store(&self) -> Result<&CheckpointStore> {
        self.checkpoints.as_ref().ok_or_else(|| AgentError::ConfigError {
            reason: "checkpoint storage is not configured".into(),
        })
    }

    /// Snapshot a session now.
    pub async fn save_checkpoint(&self, session_id: &str, summary: &str) -> Result<Checkpoint> {
        let store = self.store()?;
        let handle = self.handle(session_id)?;
        let (messages, meta) = {
            let state = handle.read();
            let meta = metadata(json!({
                "turn_count": state.turn_count,
                "agent": state.active_agent,
                "title": state.title,
                "auto": false,
            }));
            (state.messages.clone(), meta)
        };
        let checkpoint = store.save(session_id, &messages, summary, meta).await?;
        info!(session_id, checkpoint_id = %checkpoint.id, "checkpoint saved");
        Ok(checkpoint)
    }

    /// Checkpoints of a session, newest first.
    pub async fn list_checkpoints(&self, session_id: &str) -> Result<Vec<Checkpoint>> {
        Ok(self.store()?.list(session_id).await?)
    }

    /// Replace a session's history with a checkpoint. A session unknown to
    /// this process (for example after a restart) is recreated under the
    /// checkpoint's session id. Returns that id.
    pub async fn restore_from_checkpoint(&self, checkpoint_id: &str) -> Result<String> {
        let checkpoint = self
            .store()?
            .load(checkpoint_id)
            .await
            .map_err(|e| AgentError::from_checkpoint_lookup(e, checkpoint_id))?;
        let messages: Vec<Message> = checkpoint.messages_as()?;
        let session_id = checkpoint.session_id.clone();

        let existing = self.sessions.get(&session_id).map(|h| h.value().clone());
        let handle = match existing {
            Some(handle) => handle,
            None => {
                let agents = self.agents();
                let agent = checkpoint
                    .metadata
                    .get("agent")
                    .and_then(Value::as_str)
                    .filter(|name| agents.contains(name))
                    .map(str::to_owned)
                    .or_else(|| {
                        agents
                            .default_agent(self.config.default_agent.as_deref())
                            .map(|a| a.name.clone())
                    })
                    .unwrap_or_else(|| ORCHESTRATOR_AGENT.to_owned());
                let title = checkpoint
                    .metadata
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                let state = SessionState {
                    title,
                    profile: "default".to_owned(),
                    active_agent: agent,
                    messages: Vec::new(),
                    turn_count: 0,
                    created_at: checkpoint.created_at,
                    updated_at: checkpoint.created_at,
                    sub_sessions: HashMap::new(),
                };
                self.sessions
                    .entry(session_id.clone())
                    .or_insert_with(|| Arc::new(SessionHandle::new(session_id.clone(), state)))
                    .clone()
            }
        };

        let _turn = handle.turn_lock.lock().await;
        {
            let mut state = handle.write();
            state.messages = messages;
            state.turn_count = checkpoint.turn_count().unwrap_or_default();
            state.sub_sessions.clear();
            state.updated_at = Utc::now();
        }
        info!(session_id = %session_id, checkpoint_id, "session restored from checkpoint");
        Ok(session_id)
    }

    fn handle(&self, session_id: &str) -> Result<Arc<SessionHandle>> {
        self.sessions
            .get(session_id)
            .map(|h| h.value().clone())
            .ok_or_else(|| AgentError::SessionNotFound {
                session_id: session_id.to_owned(),
            })
    }
}

fn metadata(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Give every unanswered tool call of the last assistant message a
/// cancelled result, so the history stays well-formed for the next turn.
fn close_dangling_calls(history: &mut Vec<Message>) {
    let Some(pos) = history
        .iter()
        .rposition(|m| m.role == Role::Assistant && !m.tool_calls.is_empty())
    else {
        return;
    };
    let answered: Vec<&str> = history[pos + 1..]
        .iter()
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    let missing: Vec<Message> = history[pos]
        .tool_calls
        .iter()
        .filter(|c| !answered.contains(&c.id.as_str()))
        .map(|c| {
            Message::tool_result(&ToolResult::failure(
                &c.id,
                ToolErrorKind::Cancelled,
                "Cancelled before completion",
            ))
        })
        .collect();
    history.extend(missing);
}

/// Keep the partial answer of a failed run unless it is already recorded.
fn save_partial(history: &mut Vec<Message>, partial: &str) {
    let recorded = history
        .iter()
        .rev()
        .take_while(|m| m.role != Role::User)
        .any(|m| m.role == Role::Assistant && m.content == partial);
    if !recorded {
        history.push(Message::assistant(partial));
    }
}
