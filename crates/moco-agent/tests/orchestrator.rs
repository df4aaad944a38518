//! End-to-end turns through the orchestrator with scripted model backends.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    EchoTool, ScriptedBackend, SlowTool, collect_events, last_is_tool_result, tool_call,
};
use moco_agent::compressor::is_summary;
use moco_agent::{
    AgentDefinition, AgentError, AgentMode, AgentRegistry, CompressionConfig, DELEGATE_TOOL_NAME,
    Event, GuardrailConfig, MocoConfig, ModelChunk, Orchestrator, ProgressKind, ProgressStatus, Role,
};
use moco_store::{CheckpointConfig, CheckpointStore};
use moco_tools::{ShellTool, ToolErrorKind, ToolGateway};
use serde_json::json;

fn echo_gateway() -> Arc<ToolGateway> {
    Arc::new(ToolGateway::default().with_tool(Arc::new(EchoTool)))
}

// ═══════════════════════════════════════════════════════════════════════
//  Sessions
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn plain_turn_updates_history() {
    let orch = Orchestrator::builder(ScriptedBackend::replying("hello there"))
        .build()
        .unwrap();
    let id = orch.create_session("greeting", None).unwrap();

    let reply = orch.process_message("hi", &id).await.unwrap();
    assert_eq!(reply, "hello there");

    let session = orch.get_session(&id).unwrap();
    assert_eq!(session.turn_count, 1);
    assert_eq!(session.active_agent, "orchestrator");
    let roles: Vec<Role> = session.messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant]);
    assert!(session.messages[0].token_estimate.is_some());
}

#[tokio::test]
async fn unknown_session_is_an_error() {
    let orch = Orchestrator::builder(ScriptedBackend::replying("x"))
        .build()
        .unwrap();
    let err = orch.process_message("hi", "sess_missing").await.unwrap_err();
    assert!(matches!(err, AgentError::SessionNotFound { .. }));
    assert!(orch.get_session_history("sess_missing").is_err());
    assert!(!orch.cancel("sess_missing"));
}

#[tokio::test]
async fn sessions_are_listed_and_deleted() {
    let orch = Orchestrator::builder(ScriptedBackend::replying("ok"))
        .build()
        .unwrap();
    let a = orch.create_session("a", None).unwrap();
    let b = orch.create_session("b", Some("work")).unwrap();

    let listed = orch.list_sessions();
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().any(|s| s.id == b && s.profile == "work"));

    assert_eq!(orch.delete_session(&a).await.unwrap(), 0);
    assert_eq!(orch.list_sessions().len(), 1);
    assert!(orch.get_session(&a).is_err());
}

#[tokio::test]
async fn blocked_input_is_not_recorded() {
    let config = MocoConfig {
        guardrails: GuardrailConfig {
            max_input_length: 10,
            ..Default::default()
        },
        ..Default::default()
    };
    let orch = Orchestrator::builder(ScriptedBackend::replying("ok"))
        .config(config)
        .build()
        .unwrap();
    let id = orch.create_session("", None).unwrap();

    let err = orch
        .process_message("this message is far too long", &id)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::ValidationBlocked { .. }));
    assert!(orch.get_session_history(&id).unwrap().is_empty());
}

#[tokio::test]
async fn plain_turns_keep_history_within_budget() {
    let backend = ScriptedBackend::replying("a fairly long answer to keep the budget tight");
    let config = MocoConfig {
        compression: CompressionConfig {
            max_tokens: 50,
            preserve_recent: 2,
            ..Default::default()
        },
        ..Default::default()
    };
    let orch = Orchestrator::builder(backend.clone())
        .config(config)
        .build()
        .unwrap();
    let id = orch.create_session("long", None).unwrap();

    for i in 0..10 {
        orch.process_message(&format!("question {i}"), &id)
            .await
            .unwrap();
    }

    let requests = backend.requests();
    assert_eq!(requests.len(), 10);
    assert!(requests.iter().all(|r| r.messages.len() <= 3));
    let last = requests.last().unwrap();
    assert!(is_summary(&last.messages[0]));
    assert_eq!(last.messages.last().unwrap().content, "question 9");

    let history = orch.get_session_history(&id).unwrap();
    assert!(history.len() < 20);
    assert_eq!(history.iter().filter(|m| is_summary(m)).count(), 1);
    assert!(is_summary(&history[0]));
}

// ═══════════════════════════════════════════════════════════════════════
//  Routing and delegation
// ═══════════════════════════════════════════════════════════════════════

fn team() -> AgentRegistry {
    AgentRegistry::new()
        .with_agent(AgentDefinition::new("orchestrator", "route work"))
        .with_agent(
            AgentDefinition::new("coder", "write code")
                .with_description("Writes code")
                .with_mode(AgentMode::Subagent),
        )
}

#[tokio::test]
async fn mention_routes_one_turn_to_that_agent() {
    let backend = ScriptedBackend::replying("patched");
    let orch = Orchestrator::builder(backend.clone())
        .agents(team())
        .build()
        .unwrap();
    let id = orch.create_session("", None).unwrap();

    let reply = orch.process_message("@coder fix the bug", &id).await.unwrap();
    assert_eq!(reply, "@coder: patched");

    let request = &backend.requests()[0];
    assert_eq!(request.agent, "coder");
    assert_eq!(request.messages[0].content, "fix the bug");

    // Not sticky.
    orch.process_message("thanks", &id).await.unwrap();
    assert_eq!(backend.requests()[1].agent, "orchestrator");
}

#[tokio::test]
async fn unknown_mention_is_left_to_the_active_agent() {
    let backend = ScriptedBackend::replying("ok");
    let orch = Orchestrator::builder(backend.clone())
        .agents(team())
        .build()
        .unwrap();
    let id = orch.create_session("", None).unwrap();

    orch.process_message("@nobody hello", &id).await.unwrap();
    let request = &backend.requests()[0];
    assert_eq!(request.agent, "orchestrator");
    assert_eq!(request.messages[0].content, "@nobody hello");
}

#[tokio::test]
async fn delegation_result_reaches_the_orchestrator() {
    let backend = ScriptedBackend::new(|req| match req.agent.as_str() {
        "coder" => vec![ModelChunk::Text("fn main() {}".into())],
        _ if last_is_tool_result(req) => vec![ModelChunk::Text("the coder is done".into())],
        _ => vec![tool_call(
            DELEGATE_TOOL_NAME,
            json!({"agent_name": "coder", "task": "write main"}),
        )],
    });
    let orch = Arc::new(
        Orchestrator::builder(backend.clone())
            .agents(team())
            .build()
            .unwrap(),
    );
    let id = orch.create_session("", None).unwrap();

    let mut rx = orch.run("build it", &id).unwrap();
    let events = collect_events(&mut rx).await;
    assert!(matches!(events.first(), Some(Event::Start { .. })));
    assert_eq!(events.last(), Some(&Event::Done {}));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::Progress { event: ProgressKind::Delegate, name, status: ProgressStatus::Completed, .. }
            if name == "coder"
    )));
    // Delegate text is reported through progress, never as chunks.
    assert!(!events.iter().any(|e| matches!(e, Event::Chunk { content } if content.contains("fn main"))));

    let history = orch.get_session_history(&id).unwrap();
    let tool = history.iter().find(|m| m.role == Role::Tool).unwrap();
    assert_eq!(tool.content, "fn main() {}");
    assert_eq!(history.last().unwrap().content, "the coder is done");
}

#[tokio::test]
async fn self_delegation_stops_at_the_depth_cap() {
    let backend = ScriptedBackend::new(|req| {
        if last_is_tool_result(req) {
            vec![ModelChunk::Text("unwound".into())]
        } else {
            vec![tool_call(
                DELEGATE_TOOL_NAME,
                json!({"agent_name": "orchestrator", "task": "go deeper"}),
            )]
        }
    });
    let orch = Orchestrator::builder(backend.clone()).build().unwrap();
    assert_eq!(orch.config().runtime.max_delegation_depth, 5);
    let id = orch.create_session("", None).unwrap();

    let reply = orch.process_message("start", &id).await.unwrap();
    assert_eq!(reply, "unwound");

    let requests = backend.requests();
    let refusals = requests
        .iter()
        .filter_map(|r| r.messages.last())
        .filter(|m| m.error_kind == Some(ToolErrorKind::DepthExceeded))
        .count();
    assert_eq!(refusals, 1);
    // Depths 0..=5 each call the model twice.
    assert_eq!(backend.calls(), 12);
}

#[tokio::test]
async fn inline_mentions_in_the_answer_are_delegated() {
    let backend = ScriptedBackend::new(|req| match req.agent.as_str() {
        "coder" => vec![ModelChunk::Text("done coding".into())],
        _ => vec![ModelChunk::Text("Plan:\n@coder implement the parser".into())],
    });
    let orch = Orchestrator::builder(backend)
        .agents(team())
        .build()
        .unwrap();
    let id = orch.create_session("", None).unwrap();

    let reply = orch.process_message("plan it", &id).await.unwrap();
    assert!(reply.ends_with("\n\n@coder: done coding"), "{reply}");
    let history = orch.get_session_history(&id).unwrap();
    assert_eq!(history.last().unwrap().content, reply);
}

// ═══════════════════════════════════════════════════════════════════════
//  Tools: guardrails, approval, cancellation
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn blocked_tool_fails_and_turn_still_completes() {
    let dir = tempfile::tempdir().unwrap();
    let config = MocoConfig {
        guardrails: GuardrailConfig {
            blocked_tools: vec!["execute_bash".into()],
            ..Default::default()
        },
        ..Default::default()
    };
    let gateway = ToolGateway::default().with_tool(Arc::new(ShellTool::new(dir.path())));
    let backend = ScriptedBackend::tool_then_text(
        "execute_bash",
        json!({"command": "touch marker"}),
        "could not run it",
    );
    let orch = Arc::new(
        Orchestrator::builder(backend)
            .config(config)
            .gateway(Arc::new(gateway))
            .build()
            .unwrap(),
    );
    let id = orch.create_session("", None).unwrap();

    let events = collect_events(&mut orch.run("run it", &id).unwrap()).await;
    assert_eq!(events.last(), Some(&Event::Done {}));
    assert!(!dir.path().join("marker").exists());

    let history = orch.get_session_history(&id).unwrap();
    let result = history.iter().find(|m| m.role == Role::Tool).unwrap();
    assert_eq!(result.error_kind, Some(ToolErrorKind::Blocked));
    assert!(result.content.starts_with("Blocked"));
}

#[tokio::test]
async fn approved_tool_runs() {
    let config = MocoConfig {
        approval: moco_agent::ApprovalConfig {
            tools: vec!["echo".into()],
            timeout_secs: 5,
        },
        ..Default::default()
    };
    let backend = ScriptedBackend::tool_then_text("echo", json!({"text": "ping"}), "echoed");
    let orch = Arc::new(
        Orchestrator::builder(backend)
            .config(config)
            .gateway(echo_gateway())
            .build()
            .unwrap(),
    );
    let id = orch.create_session("", None).unwrap();
    let mut rx = orch.run("echo ping", &id).unwrap();

    let approval_id = loop {
        match rx.recv().await.unwrap() {
            Event::Approval { id, tool, .. } => {
                assert_eq!(tool, "echo");
                break id;
            }
            event => assert!(!event.is_terminal(), "turn ended early: {event:?}"),
        }
    };
    assert_eq!(orch.pending_approvals().len(), 1);
    assert!(orch.respond_approval(&approval_id, true));

    let events = collect_events(&mut rx).await;
    assert_eq!(events.last(), Some(&Event::Done {}));
    let history = orch.get_session_history(&id).unwrap();
    let result = history.iter().find(|m| m.role == Role::Tool).unwrap();
    assert_eq!(result.content, "ping");
    assert!(orch.pending_approvals().is_empty());
}

#[tokio::test]
async fn rejected_tool_reports_rejection() {
    let config = MocoConfig {
        approval: moco_agent::ApprovalConfig {
            tools: vec!["echo".into()],
            timeout_secs: 5,
        },
        ..Default::default()
    };
    let backend = ScriptedBackend::tool_then_text("echo", json!({"text": "ping"}), "ok then");
    let orch = Arc::new(
        Orchestrator::builder(backend)
            .config(config)
            .gateway(echo_gateway())
            .build()
            .unwrap(),
    );
    let id = orch.create_session("", None).unwrap();
    let mut rx = orch.run("echo ping", &id).unwrap();

    loop {
        if let Event::Approval { id, .. } = rx.recv().await.unwrap() {
            orch.respond_approval(&id, false);
            break;
        }
    }
    collect_events(&mut rx).await;
    let history = orch.get_session_history(&id).unwrap();
    let result = history.iter().find(|m| m.role == Role::Tool).unwrap();
    assert_eq!(result.error_kind, Some(ToolErrorKind::Rejected));
}

#[tokio::test]
async fn cancel_during_tool_stops_the_turn() {
    let backend = ScriptedBackend::tool_then_text("slow", json!({}), "never");
    let gateway = ToolGateway::default().with_tool(Arc::new(SlowTool));
    let orch = Arc::new(
        Orchestrator::builder(backend.clone())
            .gateway(Arc::new(gateway))
            .build()
            .unwrap(),
    );
    let id = orch.create_session("", None).unwrap();
    let mut rx = orch.run("take your time", &id).unwrap();

    loop {
        let event = rx.recv().await.unwrap();
        if matches!(
            &event,
            Event::Progress { event: ProgressKind::Tool, status: ProgressStatus::Running, .. }
        ) {
            break;
        }
        assert!(!event.is_terminal(), "turn ended early: {event:?}");
    }
    assert!(orch.cancel(&id));

    let events = collect_events(&mut rx).await;
    assert_eq!(events.last(), Some(&Event::Cancelled {}));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.calls(), 1);

    let session = orch.get_session(&id).unwrap();
    assert_eq!(session.turn_count, 0);
    let last = session.messages.last().unwrap();
    assert_eq!(last.role, Role::Tool);
    assert_eq!(last.error_kind, Some(ToolErrorKind::Cancelled));
}

#[tokio::test]
async fn repeated_tool_calls_abort_the_turn() {
    let backend = ScriptedBackend::new(|_| vec![tool_call("echo", json!({"text": "again"}))]);
    let orch = Orchestrator::builder(backend.clone())
        .gateway(echo_gateway())
        .build()
        .unwrap();
    let id = orch.create_session("", None).unwrap();

    let err = orch.process_message("loop", &id).await.unwrap_err();
    assert!(matches!(err, AgentError::LoopDetected { count: 3, .. }));
    assert_eq!(backend.calls(), 3);

    // A new user turn starts with a clean window.
    let err = orch.process_message("loop again", &id).await.unwrap_err();
    assert!(matches!(err, AgentError::LoopDetected { .. }));
    assert_eq!(backend.calls(), 6);
}

// ═══════════════════════════════════════════════════════════════════════
//  Checkpoints and agents
// ═══════════════════════════════════════════════════════════════════════

fn checkpoint_config(dir: &std::path::Path, interval: u32) -> CheckpointConfig {
    CheckpointConfig {
        enabled: true,
        data_dir: dir.to_path_buf(),
        auto_save_interval: interval,
        ..Default::default()
    }
}

#[tokio::test]
async fn auto_save_on_every_second_turn() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = checkpoint_config(dir.path(), 2);
    let store = CheckpointStore::open(&checkpoint).await.unwrap();
    let orch = Orchestrator::builder(ScriptedBackend::replying("noted"))
        .config(MocoConfig {
            checkpoint,
            ..Default::default()
        })
        .checkpoints(store)
        .build()
        .unwrap();
    let id = orch.create_session("notes", None).unwrap();

    orch.process_message("one", &id).await.unwrap();
    assert!(orch.list_checkpoints(&id).await.unwrap().is_empty());
    orch.process_message("two", &id).await.unwrap();

    let checkpoints = orch.list_checkpoints(&id).await.unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].turn_count(), Some(2));
    assert_eq!(checkpoints[0].messages.len(), 4);
    assert_eq!(checkpoints[0].metadata["title"], "notes");
}

#[tokio::test]
async fn restore_rewinds_history() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = checkpoint_config(dir.path(), 100);
    let store = CheckpointStore::open(&checkpoint).await.unwrap();
    let orch = Orchestrator::builder(ScriptedBackend::replying("ok"))
        .config(MocoConfig {
            checkpoint: checkpoint.clone(),
            ..Default::default()
        })
        .checkpoints(store)
        .build()
        .unwrap();
    let id = orch.create_session("", None).unwrap();

    orch.process_message("first", &id).await.unwrap();
    let saved = orch.save_checkpoint(&id, "after first").await.unwrap();
    orch.process_message("second", &id).await.unwrap();
    assert_eq!(orch.get_session_history(&id).unwrap().len(), 4);

    assert_eq!(orch.restore_from_checkpoint(&saved.id).await.unwrap(), id);
    let session = orch.get_session(&id).unwrap();
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.messages[0].content, "first");
    assert_eq!(session.turn_count, 1);

    // A fresh process recreates the session from the same file.
    let reopened = Orchestrator::builder(ScriptedBackend::replying("ok"))
        .checkpoints(CheckpointStore::open(&checkpoint).await.unwrap())
        .build()
        .unwrap();
    assert_eq!(reopened.restore_from_checkpoint(&saved.id).await.unwrap(), id);
    assert_eq!(reopened.get_session_history(&id).unwrap().len(), 2);

    let err = reopened.restore_from_checkpoint("cp_missing").await.unwrap_err();
    assert!(matches!(err, AgentError::CheckpointNotFound { .. }));
}

#[tokio::test]
async fn reload_picks_up_new_agent_files() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("orchestrator.toml"), "system_prompt = \"route\"\n").unwrap();
    let orch = Orchestrator::builder(ScriptedBackend::replying("ok"))
        .config(MocoConfig {
            agents_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        })
        .build()
        .unwrap();
    assert_eq!(orch.agents().names(), vec!["orchestrator"]);

    std::fs::write(
        dir.path().join("writer.toml"),
        "mode = \"subagent\"\nsystem_prompt = \"write\"\n",
    )
    .unwrap();
    assert_eq!(orch.reload_agents().unwrap(), 2);
    assert!(orch.agents().contains("writer"));
}
