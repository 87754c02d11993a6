//! Engine behaviour over the campaign graph with stub handlers.
//!
//! Every node except the router is a stub that records its calls; the router
//! is the real `RouterNode` backed by a stub provider with a call counter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use campaignflow::decision::{Decision, DecisionOutcome, DecisionProvider};
use campaignflow::engine::graph::ids;
use campaignflow::engine::progress::ProgressEvent;
use campaignflow::engine::types::*;
use campaignflow::engine::{
    EngineConfig, EngineError, NodeExecutor, StartOptions, WorkflowEngine, campaign_graph,
    time_budget,
};
use campaignflow::nodes::builtin::router_node::RouterNode;
use campaignflow::nodes::{Node, NodeContext, NodeRegistry};
use campaignflow::storage::{MemoryStateStore, StateStore};

// ===== Stubs =====

#[derive(Clone, Default)]
struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    fn record(&self, id: &str) {
        self.0.lock().unwrap().push(id.to_string());
    }

    fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn count(&self, id: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|c| *c == id).count()
    }
}

#[derive(Clone)]
enum Behavior {
    Pass,
    Fail(&'static str),
    Hang,
    SetField(&'static str, Value),
    SetScratch(&'static str, Value),
    RemoveField(&'static str),
    SetDecision,
    RewriteMessages,
}

struct StubNode {
    id: String,
    log: CallLog,
    behavior: Behavior,
}

#[async_trait]
impl Node for StubNode {
    fn name(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        "stub"
    }

    async fn execute(&self, mut state: ExecutionState, _ctx: &NodeContext) -> Result<ExecutionState> {
        self.log.record(&self.id);
        match &self.behavior {
            Behavior::Pass => {}
            Behavior::Fail(msg) => anyhow::bail!("{}", msg),
            Behavior::Hang => std::future::pending::<()>().await,
            Behavior::SetField(key, value) => state.set_field(key, value.clone()),
            Behavior::SetScratch(key, value) => {
                state.scratch.insert(key.to_string(), value.clone());
            }
            Behavior::RemoveField(key) => {
                state.business_fields.remove(*key);
            }
            Behavior::SetDecision => state.decision = Some(Decision::Enrich),
            Behavior::RewriteMessages => state.messages.clear(),
        }
        state.push_message(format!("{} done", self.id));
        Ok(state)
    }
}

struct StubProvider {
    answer: Option<Decision>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl DecisionProvider for StubProvider {
    fn name(&self) -> &str {
        "stub"
    }

    async fn decide(&self, _state: &ExecutionState) -> Result<DecisionOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.answer {
            Some(decision) => Ok(DecisionOutcome {
                decision: decision.clone(),
                reasoning: "stubbed".to_string(),
            }),
            None => anyhow::bail!("provider unavailable"),
        }
    }
}

struct Harness {
    engine: WorkflowEngine,
    log: CallLog,
    provider_calls: Arc<AtomicUsize>,
}

fn harness_with(
    store: Arc<dyn StateStore>,
    answer: Option<Decision>,
    overrides: &[(&str, Behavior)],
    config: EngineConfig,
) -> Harness {
    let log = CallLog::default();
    let provider_calls = Arc::new(AtomicUsize::new(0));
    let mut registry = NodeRegistry::new();

    for id in campaign_graph().nodes() {
        if id == ids::ROUTER {
            continue;
        }
        let behavior = overrides
            .iter()
            .find(|(name, _)| *name == id.as_str())
            .map(|(_, b)| b.clone())
            .unwrap_or(Behavior::Pass);
        registry.register(Arc::new(StubNode {
            id: id.clone(),
            log: log.clone(),
            behavior,
        }));
    }
    registry.register(Arc::new(RouterNode::new(Arc::new(StubProvider {
        answer,
        calls: provider_calls.clone(),
    }))));

    let engine = WorkflowEngine::new(campaign_graph(), Arc::new(registry), store, config).unwrap();
    Harness {
        engine,
        log,
        provider_calls,
    }
}

fn harness(
    store: &Arc<MemoryStateStore>,
    answer: Decision,
    overrides: &[(&str, Behavior)],
) -> Harness {
    harness_with(store.clone(), Some(answer), overrides, EngineConfig::default())
}

fn reflect_path() -> Vec<String> {
    [
        ids::LOAD_CONTEXT,
        ids::ANALYZE_FILES,
        ids::ROUTER,
        ids::REFLECTION,
        ids::ADJUSTMENT,
        ids::SAVE,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Run until the handler hangs, then drop the start future as a killed
/// process would.
async fn start_and_kill(engine: &WorkflowEngine, run_key: &str) {
    let outcome = tokio::time::timeout(
        Duration::from_millis(200),
        engine.start(run_key, RunInputs::default(), StartOptions::default()),
    )
    .await;
    assert!(outcome.is_err(), "run should still be hanging when killed");
}

// ===== Happy paths =====

#[tokio::test]
async fn reflect_decision_runs_reflect_path() {
    let store = Arc::new(MemoryStateStore::new());
    let h = harness(&store, Decision::Reflect, &[]);

    let state = h
        .engine
        .start("p1", RunInputs::default(), StartOptions::default())
        .await
        .unwrap();

    assert_eq!(state.flow_status, FlowStatus::Completed);
    assert_eq!(state.completed_nodes, reflect_path());
    assert_eq!(state.last_completed_node.as_deref(), Some(ids::SAVE));
    assert!(state.current_executing_node.is_none());
    assert_eq!(state.decision, Some(Decision::Reflect));
    assert_eq!(h.log.calls(), reflect_path());
    assert_eq!(h.provider_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn initialize_decision_runs_setup_path() {
    let store = Arc::new(MemoryStateStore::new());
    let h = harness(&store, Decision::Initialize, &[]);

    let state = h
        .engine
        .start("p1", RunInputs::default(), StartOptions::default())
        .await
        .unwrap();

    assert_eq!(
        state.completed_nodes,
        vec![
            ids::LOAD_CONTEXT,
            ids::ANALYZE_FILES,
            ids::ROUTER,
            ids::DISCOVERY,
            ids::DATA_COLLECTION,
            ids::INSIGHT,
            ids::CAMPAIGN_SETUP,
            ids::SAVE,
        ]
    );
}

#[tokio::test]
async fn continue_decision_routes_by_phase() {
    let store = Arc::new(MemoryStateStore::new());
    let h = harness(
        &store,
        Decision::Continue,
        &[(ids::LOAD_CONTEXT, Behavior::SetField("current_phase", json!("optimizing")))],
    );

    let state = h
        .engine
        .start("p1", RunInputs::default(), StartOptions::default())
        .await
        .unwrap();

    assert_eq!(
        state.completed_nodes,
        vec![
            ids::LOAD_CONTEXT,
            ids::ANALYZE_FILES,
            ids::ROUTER,
            ids::ADJUSTMENT,
            ids::SAVE
        ]
    );
}

// ===== Resume =====

#[tokio::test]
async fn p1_killed_after_reflection_resumes_with_adjustment() {
    let store = Arc::new(MemoryStateStore::new());

    let first = harness(&store, Decision::Reflect, &[(ids::ADJUSTMENT, Behavior::Hang)]);
    start_and_kill(&first.engine, "P1").await;
    assert!(!first.engine.is_active("P1"));

    let cp = store.load_checkpoint("P1").await.unwrap().unwrap();
    assert_eq!(cp.flow_status, FlowStatus::InProgress);
    assert_eq!(cp.last_completed_node.as_deref(), Some(ids::REFLECTION));
    assert_eq!(cp.decision, Some(Decision::Reflect));

    let second = harness(&store, Decision::Reflect, &[]);
    let state = second
        .engine
        .start("P1", RunInputs::default(), StartOptions::default())
        .await
        .unwrap();

    assert_eq!(second.log.calls(), vec![ids::ADJUSTMENT, ids::SAVE]);
    assert_eq!(second.provider_calls.load(Ordering::SeqCst), 0);
    assert_eq!(state.flow_status, FlowStatus::Completed);
    assert_eq!(state.completed_nodes, reflect_path());
}

#[tokio::test]
async fn failed_node_is_retried_and_earlier_nodes_are_not() {
    let store = Arc::new(MemoryStateStore::new());

    let first = harness(
        &store,
        Decision::Initialize,
        &[(ids::CAMPAIGN_SETUP, Behavior::Fail("ad platform rejected config"))],
    );
    let err = first
        .engine
        .start("p1", RunInputs::default(), StartOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::NodeExecution { .. }));
    assert_eq!(err.failed_node(), Some(ids::CAMPAIGN_SETUP));
    assert!(err.is_resumable());
    let failed = err.state().unwrap();
    assert_eq!(failed.flow_status, FlowStatus::Failed);
    assert_eq!(
        failed.errors,
        vec!["campaign_setup failed: ad platform rejected config".to_string()]
    );

    let cp = store.load_checkpoint("p1").await.unwrap().unwrap();
    assert_eq!(cp.flow_status, FlowStatus::Failed);
    assert_eq!(cp.last_completed_node.as_deref(), Some(ids::INSIGHT));
    assert!(cp.current_executing_node.is_none());

    let second = harness(&store, Decision::Initialize, &[]);
    let state = second
        .engine
        .start("p1", RunInputs::default(), StartOptions::default())
        .await
        .unwrap();

    assert_eq!(second.log.calls(), vec![ids::CAMPAIGN_SETUP, ids::SAVE]);
    assert_eq!(second.provider_calls.load(Ordering::SeqCst), 0);
    assert_eq!(state.flow_status, FlowStatus::Completed);
    // The failure stays in the log of the session.
    assert_eq!(state.errors.len(), 1);
}

#[tokio::test]
async fn branch_decision_is_not_recomputed_after_kill_past_router() {
    let store = Arc::new(MemoryStateStore::new());

    let first = harness(&store, Decision::Enrich, &[(ids::DISCOVERY, Behavior::Hang)]);
    start_and_kill(&first.engine, "p1").await;
    assert_eq!(first.provider_calls.load(Ordering::SeqCst), 1);

    // A provider that would now answer differently is never consulted.
    let second = harness(&store, Decision::Reflect, &[]);
    let state = second
        .engine
        .start("p1", RunInputs::default(), StartOptions::default())
        .await
        .unwrap();

    assert_eq!(second.provider_calls.load(Ordering::SeqCst), 0);
    assert_eq!(second.log.calls()[0], ids::DISCOVERY);
    assert_eq!(state.decision, Some(Decision::Enrich));
}

#[tokio::test]
async fn completed_project_starts_new_session_keeping_business_fields() {
    let store = Arc::new(MemoryStateStore::new());
    let first = harness(
        &store,
        Decision::Initialize,
        &[(ids::INSIGHT, Behavior::SetField("current_strategy", json!({"daily_budget": 80})))],
    );
    let s1 = first
        .engine
        .start("p1", RunInputs::default(), StartOptions::default())
        .await
        .unwrap();
    assert_eq!(s1.session_num, 1);

    let second = harness(&store, Decision::Continue, &[]);
    let s2 = second
        .engine
        .start("p1", RunInputs::default(), StartOptions::default())
        .await
        .unwrap();

    assert_eq!(s2.session_num, 2);
    assert_ne!(s2.session_id, s1.session_id);
    assert_eq!(second.log.calls()[0], ids::LOAD_CONTEXT);
    assert_eq!(second.provider_calls.load(Ordering::SeqCst), 1);
    assert_eq!(s2.decision, Some(Decision::Continue));
    assert_eq!(s2.field("current_strategy"), Some(&json!({"daily_budget": 80})));
    assert_eq!(s2.completed_nodes.first().map(String::as_str), Some(ids::LOAD_CONTEXT));
}

#[tokio::test]
async fn new_session_starts_with_empty_logs() {
    let store = Arc::new(MemoryStateStore::new());
    let first = harness_with(
        store.clone(),
        None,
        &[(ids::INSIGHT, Behavior::SetField("current_strategy", json!({"daily_budget": 80})))],
        EngineConfig::default(),
    );
    let s1 = first
        .engine
        .start("p1", RunInputs::default(), StartOptions::default())
        .await
        .unwrap();
    assert!(s1.errors[0].starts_with("Router error"));
    assert!(s1.messages.iter().any(|m| m == "save done"));

    let second = harness(&store, Decision::Continue, &[]);
    let s2 = second
        .engine
        .start("p1", RunInputs::default(), StartOptions::default())
        .await
        .unwrap();

    assert!(s2.errors.is_empty());
    assert_eq!(s2.messages[0], "Starting session 2");
    assert_eq!(s2.messages.iter().filter(|m| *m == "load_context done").count(), 1);
    assert_eq!(s2.field("current_strategy"), Some(&json!({"daily_budget": 80})));

    let cp = store.load_checkpoint("p1").await.unwrap().unwrap();
    assert!(cp.errors.is_empty());
    assert_eq!(cp.messages, s2.messages);
}

#[tokio::test]
async fn force_restart_starts_at_entry() {
    let store = Arc::new(MemoryStateStore::new());
    let first = harness(&store, Decision::Reflect, &[(ids::ADJUSTMENT, Behavior::Hang)]);
    start_and_kill(&first.engine, "p1").await;

    let second = harness(&store, Decision::Initialize, &[]);
    let state = second
        .engine
        .start(
            "p1",
            RunInputs::default(),
            StartOptions {
                force_restart: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(second.log.calls()[0], ids::LOAD_CONTEXT);
    assert_eq!(second.provider_calls.load(Ordering::SeqCst), 1);
    assert_eq!(state.decision, Some(Decision::Initialize));
    assert_eq!(state.completed_nodes[0], ids::LOAD_CONTEXT);
    assert!(!state.completed_nodes.contains(&ids::REFLECTION.to_string()));
    assert!(
        state
            .messages
            .iter()
            .any(|m| m.contains("restarted from the entry node"))
    );
}

#[tokio::test]
async fn inputs_before_routing_restart_the_session_flow() {
    let store = Arc::new(MemoryStateStore::new());
    let first = harness(&store, Decision::Initialize, &[(ids::ANALYZE_FILES, Behavior::Hang)]);
    start_and_kill(&first.engine, "p1").await;

    let mut context = serde_json::Map::new();
    context.insert("target_budget".into(), json!(150));
    let inputs = RunInputs {
        files: vec!["results.csv".into()],
        context,
    };

    let second = harness(&store, Decision::Initialize, &[]);
    let state = second
        .engine
        .start("p1", inputs, StartOptions::default())
        .await
        .unwrap();

    assert_eq!(second.log.calls()[0], ids::LOAD_CONTEXT);
    assert_eq!(state.field("uploaded_files"), Some(&json!(["results.csv"])));
    assert_eq!(state.field("user_inputs"), Some(&json!({"target_budget": 150})));
}

#[tokio::test]
async fn inputs_after_routing_are_ignored() {
    let store = Arc::new(MemoryStateStore::new());
    let first = harness(&store, Decision::Reflect, &[(ids::REFLECTION, Behavior::Hang)]);
    start_and_kill(&first.engine, "p1").await;

    let inputs = RunInputs {
        files: vec!["late.csv".into()],
        context: serde_json::Map::new(),
    };
    let second = harness(&store, Decision::Initialize, &[]);
    let state = second
        .engine
        .start("p1", inputs, StartOptions::default())
        .await
        .unwrap();

    assert_eq!(second.provider_calls.load(Ordering::SeqCst), 0);
    assert_eq!(second.log.calls()[0], ids::REFLECTION);
    assert_eq!(state.decision, Some(Decision::Reflect));
    assert_eq!(state.field("uploaded_files"), Some(&json!([])));
    assert!(state.messages.iter().any(|m| m.starts_with("New inputs ignored")));
}

// ===== Durability =====

#[tokio::test]
async fn checkpoint_reproduces_returned_state() {
    let store = Arc::new(MemoryStateStore::new());
    let h = harness(
        &store,
        Decision::Reflect,
        &[
            (ids::ANALYZE_FILES, Behavior::SetScratch("file_rows", json!({"a.csv": [[1, 2]]}))),
            (ids::REFLECTION, Behavior::SetField("threshold_status", json!("not_met"))),
        ],
    );
    let state = h
        .engine
        .start("p1", RunInputs::default(), StartOptions::default())
        .await
        .unwrap();

    let reloaded = ExecutionState::from_checkpoint(store.load_checkpoint("p1").await.unwrap().unwrap());

    let mut expected = state.clone();
    expected.scratch.clear();
    assert_eq!(reloaded, expected);
}

#[tokio::test]
async fn executor_checkpoint_matches_handler_output() {
    let store = Arc::new(MemoryStateStore::new());
    let log = CallLog::default();
    let node = StubNode {
        id: "discovery".into(),
        log: log.clone(),
        behavior: Behavior::SetField("knowledge_facts", json!({"target_cpa": {"value": 20}})),
    };
    let executor = NodeExecutor::new(store.clone(), ids::ROUTER, ids::SAVE);
    let ctx = NodeContext {
        run_key: "p1".into(),
        node_id: "discovery".into(),
        store: store.clone(),
        cancel: CancellationToken::new(),
        events: Arc::new(Default::default()),
    };

    let state = executor
        .execute(&node, ExecutionState::new("p1"), &ctx, None)
        .await
        .unwrap();

    assert_eq!(state.completed_nodes, vec!["discovery"]);
    assert_eq!(state.flow_status, FlowStatus::InProgress);
    assert_eq!(state.checkpoint_seq, 1);

    let cp = store.load_checkpoint("p1").await.unwrap().unwrap();
    assert_eq!(cp.sequence, 1);
    assert_eq!(ExecutionState::from_checkpoint(cp), state);
}

#[tokio::test]
async fn scratch_never_reaches_the_store() {
    let store = Arc::new(MemoryStateStore::new());
    let h = harness(
        &store,
        Decision::Reflect,
        &[(ids::ANALYZE_FILES, Behavior::SetScratch("file_rows", json!({"raw.csv": ["secret-row"]})))],
    );
    let state = h
        .engine
        .start("p1", RunInputs::default(), StartOptions::default())
        .await
        .unwrap();

    // Later nodes of the same run still see it.
    assert!(state.scratch.contains_key("file_rows"));

    let cp = store.load_checkpoint("p1").await.unwrap().unwrap();
    let persisted = serde_json::to_string(&cp).unwrap();
    assert!(!persisted.contains("secret-row"));
    assert!(!persisted.contains("scratch"));
}

#[tokio::test]
async fn checkpoint_sequence_grows_with_every_node() {
    let store = Arc::new(MemoryStateStore::new());
    let h = harness(&store, Decision::Reflect, &[]);
    let state = h
        .engine
        .start("p1", RunInputs::default(), StartOptions::default())
        .await
        .unwrap();

    assert_eq!(state.checkpoint_seq, reflect_path().len() as u64);
}

#[tokio::test]
async fn start_marker_adds_a_checkpoint_per_node() {
    let store = Arc::new(MemoryStateStore::new());
    let first = harness_with(
        store.clone(),
        Some(Decision::Reflect),
        &[(ids::ADJUSTMENT, Behavior::Hang)],
        EngineConfig {
            checkpoint_on_start: true,
            ..Default::default()
        },
    );
    start_and_kill(&first.engine, "p1").await;

    let cp = store.load_checkpoint("p1").await.unwrap().unwrap();
    assert_eq!(cp.current_executing_node.as_deref(), Some(ids::ADJUSTMENT));
    assert_eq!(cp.last_completed_node.as_deref(), Some(ids::REFLECTION));

    let second = harness(&store, Decision::Reflect, &[]);
    second
        .engine
        .start("p1", RunInputs::default(), StartOptions::default())
        .await
        .unwrap();
    assert_eq!(second.log.calls(), vec![ids::ADJUSTMENT, ids::SAVE]);
}

// ===== Validation =====

#[tokio::test]
async fn removing_a_business_field_fails_validation() {
    let store = Arc::new(MemoryStateStore::new());
    let h = harness(
        &store,
        Decision::Reflect,
        &[
            (ids::LOAD_CONTEXT, Behavior::SetField("iteration", json!(0))),
            (ids::REFLECTION, Behavior::RemoveField("iteration")),
        ],
    );
    let err = h
        .engine
        .start("p1", RunInputs::default(), StartOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Validation { .. }));
    assert_eq!(err.failed_node(), Some(ids::REFLECTION));

    let cp = store.load_checkpoint("p1").await.unwrap().unwrap();
    assert_eq!(cp.flow_status, FlowStatus::Failed);
    assert_eq!(cp.last_completed_node.as_deref(), Some(ids::ROUTER));
    assert!(cp.business_fields.contains_key("iteration"));
    assert!(cp.errors[0].contains("business field 'iteration' was removed"));
}

#[tokio::test]
async fn only_the_branch_node_may_decide() {
    let store = Arc::new(MemoryStateStore::new());
    let h = harness(&store, Decision::Reflect, &[(ids::REFLECTION, Behavior::SetDecision)]);
    let err = h
        .engine
        .start("p1", RunInputs::default(), StartOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Validation { .. }));
    assert_eq!(err.state().unwrap().decision, Some(Decision::Reflect));
}

#[tokio::test]
async fn messages_are_append_only() {
    let store = Arc::new(MemoryStateStore::new());
    let h = harness(&store, Decision::Reflect, &[(ids::ANALYZE_FILES, Behavior::RewriteMessages)]);
    let err = h
        .engine
        .start("p1", RunInputs::default(), StartOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Validation { .. }));
    assert_eq!(err.failed_node(), Some(ids::ANALYZE_FILES));
}

// ===== Cancellation and time limits =====

#[tokio::test]
async fn cancellation_keeps_the_previous_checkpoint() {
    let store = Arc::new(MemoryStateStore::new());
    let h = harness(&store, Decision::Reflect, &[(ids::ADJUSTMENT, Behavior::Hang)]);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = h
        .engine
        .start(
            "p1",
            RunInputs::default(),
            StartOptions {
                cancel: Some(cancel),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Cancelled { .. }));
    assert_eq!(err.failed_node(), Some(ids::ADJUSTMENT));

    let cp = store.load_checkpoint("p1").await.unwrap().unwrap();
    assert_eq!(cp.flow_status, FlowStatus::InProgress);
    assert_eq!(cp.last_completed_node.as_deref(), Some(ids::REFLECTION));
    assert!(cp.errors.is_empty());
}

#[tokio::test]
async fn deadline_stops_the_run_without_failing_it() {
    let store = Arc::new(MemoryStateStore::new());
    let h = harness(&store, Decision::Reflect, &[(ids::SAVE, Behavior::Hang)]);

    let err = h
        .engine
        .start(
            "p1",
            RunInputs::default(),
            StartOptions {
                deadline: Some(Duration::from_millis(100)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::DeadlineExceeded { .. }));
    let cp = store.load_checkpoint("p1").await.unwrap().unwrap();
    assert_eq!(cp.flow_status, FlowStatus::InProgress);
    assert_eq!(cp.last_completed_node.as_deref(), Some(ids::ADJUSTMENT));
}

#[test]
fn time_budget_parses_user_seconds() {
    assert_eq!(time_budget(None).unwrap(), None);
    assert_eq!(time_budget(Some(0.0)).unwrap(), None);
    assert_eq!(time_budget(Some(-5.0)).unwrap(), None);
    assert_eq!(time_budget(Some(f64::NAN)).unwrap(), None);
    assert_eq!(time_budget(Some(1.5)).unwrap(), Some(Duration::from_millis(1500)));
    assert!(time_budget(Some(f64::INFINITY)).is_err());
    assert!(time_budget(Some(1.0e20)).is_err());
}

#[tokio::test]
async fn unbounded_deadline_lets_the_run_finish() {
    let store = Arc::new(MemoryStateStore::new());
    let h = harness(&store, Decision::Reflect, &[]);

    let state = h
        .engine
        .start(
            "p1",
            RunInputs::default(),
            StartOptions {
                deadline: Some(Duration::MAX),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(state.flow_status, FlowStatus::Completed);
    assert_eq!(state.completed_nodes, reflect_path());
}

#[tokio::test]
async fn node_timeout_fails_the_node() {
    let store = Arc::new(MemoryStateStore::new());
    let h = harness_with(
        store.clone(),
        Some(Decision::Reflect),
        &[(ids::ANALYZE_FILES, Behavior::Hang)],
        EngineConfig {
            node_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        },
    );

    let err = h
        .engine
        .start("p1", RunInputs::default(), StartOptions::default())
        .await
        .unwrap_err();

    match &err {
        EngineError::NodeExecution { node, message, .. } => {
            assert_eq!(node, ids::ANALYZE_FILES);
            assert!(message.contains("timed out after"));
        }
        other => panic!("unexpected error: {other}"),
    }
    let cp = store.load_checkpoint("p1").await.unwrap().unwrap();
    assert_eq!(cp.flow_status, FlowStatus::Failed);
}

// ===== Routing =====

#[tokio::test]
async fn unrecognized_decision_falls_back_with_warning() {
    let store = Arc::new(MemoryStateStore::new());
    let h = harness(&store, Decision::Unrecognized("escalate".into()), &[]);

    let state = h
        .engine
        .start("p1", RunInputs::default(), StartOptions::default())
        .await
        .unwrap();

    assert_eq!(state.flow_status, FlowStatus::Completed);
    assert_eq!(state.completed_nodes[3], ids::DISCOVERY);
    assert!(state.messages.iter().any(|m| m.starts_with("Routing warning")));
    assert!(state.errors.is_empty());
}

#[tokio::test]
async fn provider_error_routes_to_initialize() {
    let store = Arc::new(MemoryStateStore::new());
    let h = harness_with(store.clone(), None, &[], EngineConfig::default());

    let state = h
        .engine
        .start("p1", RunInputs::default(), StartOptions::default())
        .await
        .unwrap();

    assert_eq!(state.decision, Some(Decision::Initialize));
    assert_eq!(state.completed_nodes[3], ids::DISCOVERY);
    assert!(state.errors[0].starts_with("Router error"));
}

// ===== Concurrency and construction =====

#[tokio::test]
async fn second_start_on_active_run_is_rejected() {
    let store = Arc::new(MemoryStateStore::new());
    let h = harness(&store, Decision::Reflect, &[(ids::ANALYZE_FILES, Behavior::Hang)]);
    let engine = Arc::new(h.engine);

    let cancel = CancellationToken::new();
    let running = {
        let engine = engine.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            engine
                .start(
                    "p1",
                    RunInputs::default(),
                    StartOptions {
                        cancel: Some(cancel),
                        ..Default::default()
                    },
                )
                .await
        })
    };

    while !engine.is_active("p1") {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let err = engine
        .start("p1", RunInputs::default(), StartOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::RunActive(_)));
    assert!(!err.is_resumable());

    // Other run keys are unaffected.
    assert!(!engine.is_active("p2"));

    cancel.cancel();
    let first = running.await.unwrap();
    assert!(matches!(first, Err(EngineError::Cancelled { .. })));
    assert!(!engine.is_active("p1"));
}

#[tokio::test]
async fn engine_requires_a_handler_for_every_node() {
    let mut registry = NodeRegistry::new();
    registry.register(Arc::new(StubNode {
        id: ids::LOAD_CONTEXT.into(),
        log: CallLog::default(),
        behavior: Behavior::Pass,
    }));

    let result = WorkflowEngine::new(
        campaign_graph(),
        Arc::new(registry),
        Arc::new(MemoryStateStore::new()),
        EngineConfig::default(),
    );

    match result {
        Err(EngineError::Graph(msg)) => assert!(msg.contains("No handler registered for node 'save'")),
        _ => panic!("expected a graph error"),
    }
}

// ===== Persistence failures =====

struct BrokenStore;

#[async_trait]
impl StateStore for BrokenStore {
    async fn load_checkpoint(&self, _run_key: &str) -> Result<Option<Checkpoint>> {
        Ok(None)
    }
    async fn save_checkpoint(&self, _checkpoint: &Checkpoint) -> Result<()> {
        anyhow::bail!("disk full")
    }
    async fn save_snapshot(&self, _snapshot: &ProjectSnapshot) -> Result<()> {
        Ok(())
    }
    async fn load_snapshot(&self, _run_key: &str) -> Result<Option<ProjectSnapshot>> {
        Ok(None)
    }
    async fn list_checkpoints(&self, _status: Option<FlowStatus>) -> Result<Vec<Checkpoint>> {
        Ok(Vec::new())
    }
    async fn delete_run(&self, _run_key: &str) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn persistence_failure_reports_in_memory_state() {
    let h = harness_with(
        Arc::new(BrokenStore),
        Some(Decision::Reflect),
        &[],
        EngineConfig::default(),
    );

    let err = h
        .engine
        .start("p1", RunInputs::default(), StartOptions::default())
        .await
        .unwrap_err();

    match &err {
        EngineError::Persistence { message, state } => {
            assert!(message.contains("disk full"));
            let state = state.as_ref().unwrap();
            assert_eq!(state.run_key, "p1");
            assert!(state.messages.iter().any(|m| m == "load_context done"));
        }
        other => panic!("unexpected error: {other}"),
    }
    // Nothing past the first node ran.
    assert_eq!(h.log.calls(), vec![ids::LOAD_CONTEXT]);
}

// ===== Progress events =====

#[tokio::test]
async fn progress_events_frame_the_run() {
    let store = Arc::new(MemoryStateStore::new());
    let h = harness(&store, Decision::Reflect, &[]);
    let mut rx = h.engine.events().subscribe();

    h.engine
        .start("p1", RunInputs::default(), StartOptions::default())
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    assert!(matches!(events.first(), Some(ProgressEvent::RunStarted { mode, .. }) if mode == "fresh"));
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::RunFinished {
            status: FlowStatus::Completed,
            ..
        })
    ));
    let completed: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::NodeCompleted { node, .. } => Some(node.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(completed, reflect_path());
    assert!(events.iter().any(|e| matches!(
        e,
        ProgressEvent::Routed { decision, next, .. } if decision == "reflect" && next == ids::REFLECTION
    )));
    assert_eq!(h.log.count(ids::SAVE), 1);
}
