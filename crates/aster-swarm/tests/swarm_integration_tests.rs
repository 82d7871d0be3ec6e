//! Integration Tests for the agent swarm
//!
//! Several agents, each with its own message bus, share one in-memory
//! network. These tests cover end-to-end scenarios across components:
//! - Task chains with failure branches
//! - DAG workflows with fan-out/fan-in, failures and timeouts
//! - Remote coordination through the bus
//! - Configuration loading

use aster_swarm::bus::MessageBusConfig;
use aster_swarm::coordination::{CoordinationConfig, Coordinator};
use aster_swarm::workflow::{
    task_handler_fn, ChainStep, DagNode, ExecutorConfig, FailurePolicy, RetryPolicy,
    StepCondition, StepSpec, StepStatus, TaskEndpoint, TaskHandler, TaskOutcome, WorkflowStatus,
};
use aster_swarm::{
    CapabilityRegistry, ChainExecutor, CoordinationClient, CoordinationError, CoordinationService,
    DagExecutor, DagWorkflow, InMemoryNetwork, LockType, MessageBus, SwarmConfig, TaskChain,
    WorkflowError,
};
use serde_json::{json, Value};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

async fn connect(network: &InMemoryNetwork, id: &str) -> MessageBus {
    MessageBus::connect(Arc::new(network.endpoint(id)), MessageBusConfig::default())
        .await
        .expect("bus should start")
}

/// Handler understanding three task types:
/// - "concat": joins input `parts` (array of strings)
/// - "fail": always fails
/// - "slow": sleeps for input `ms` then echoes it
fn worker_handler() -> Arc<dyn TaskHandler> {
    task_handler_fn(|request| async move {
        match request.task_type.as_str() {
            "concat" => {
                let parts: Vec<String> = request
                    .input
                    .values()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
                Ok(TaskOutcome::new(json!({ "text": parts.join("+") })).with_price(0.25))
            }
            "slow" => {
                let ms = request.input.get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(TaskOutcome::new(json!({ "slept": ms })))
            }
            "scalar" => Ok(TaskOutcome::new(json!(7))),
            _ => anyhow::bail!("cannot do {}", request.task_type),
        }
    })
}

struct Swarm {
    network: InMemoryNetwork,
    registry: Arc<CapabilityRegistry>,
    _agents: Vec<MessageBus>,
}

async fn swarm(agents: &[&str]) -> Swarm {
    let network = InMemoryNetwork::new();
    let registry = Arc::new(CapabilityRegistry::new());
    let mut buses = Vec::new();
    for agent in agents {
        let bus = connect(&network, agent).await;
        TaskEndpoint::attach(&bus, worker_handler());
        registry.register_agent(*agent, ["text"]);
        buses.push(bus);
    }
    Swarm {
        network,
        registry,
        _agents: buses,
    }
}

fn executor_config() -> ExecutorConfig {
    ExecutorConfig::default()
        .with_default_step_timeout(Duration::from_secs(2))
        .with_retry(RetryPolicy::immediate())
}

fn text_step(id: &str, task_type: &str) -> StepSpec {
    StepSpec::new(id, task_type).with_capabilities(["text"])
}

// ============================================================================
// Task chains
// ============================================================================

#[tokio::test]
async fn test_chain_failure_branch_uses_earlier_output() {
    let swarm = swarm(&["agent-1", "agent-2"]).await;
    let executor = ChainExecutor::new(
        connect(&swarm.network, "orchestrator").await,
        swarm.registry.clone(),
        executor_config(),
    );

    let mut chain = TaskChain::new("three-steps")
        .then(text_step("first", "concat").with_input("a", json!("x")))
        .unwrap()
        .then(text_step("second", "fail").with_input_mapping("a", "first.text"))
        .unwrap()
        .then(
            ChainStep::new(text_step("third", "concat").with_input_mapping("a", "first.text"))
                .with_condition(StepCondition::OnFailure),
        )
        .unwrap();

    executor.execute_chain(&mut chain).await.unwrap();

    assert_eq!(chain.status, WorkflowStatus::Completed);
    assert_eq!(chain.step("second").unwrap().state.status, StepStatus::Failed);
    assert!(chain.step("second").unwrap().state.error.is_some());
    assert_eq!(chain.output("third").unwrap()["text"], json!("x"));
    assert_eq!(chain.summary().completed, 2);
    assert_eq!(chain.summary().failed, 1);
}

#[tokio::test]
async fn test_chain_retries_on_another_agent() {
    let swarm = swarm(&["healthy"]).await;
    // A registered agent that never answers
    swarm.registry.register_agent("silent", ["text"]);

    let executor = ChainExecutor::new(
        connect(&swarm.network, "orchestrator").await,
        swarm.registry.clone(),
        ExecutorConfig::default()
            .with_default_step_timeout(Duration::from_millis(200))
            .with_retry(RetryPolicy::immediate()),
    );

    for _ in 0..2 {
        let mut chain = TaskChain::new("retry")
            .then(text_step("only", "concat").with_max_retries(1))
            .unwrap();
        executor.execute_chain(&mut chain).await.unwrap();
        let state = &chain.step("only").unwrap().state;
        assert_eq!(state.status, StepStatus::Completed);
        assert_eq!(state.assigned_to.as_deref(), Some("healthy"));
    }
}

#[tokio::test]
async fn test_scalar_result_wrapped_for_mapping() {
    let swarm = swarm(&["agent-1"]).await;
    let executor = ChainExecutor::new(
        connect(&swarm.network, "orchestrator").await,
        swarm.registry.clone(),
        executor_config(),
    );

    let mut chain = TaskChain::new("scalar")
        .then(text_step("number", "scalar"))
        .unwrap()
        .then(text_step("use", "concat").with_input_mapping("n", "number.raw_result"))
        .unwrap();
    executor.execute_chain(&mut chain).await.unwrap();
    assert_eq!(chain.output("number").unwrap()["raw_result"], json!(7));
}

// ============================================================================
// DAG workflows
// ============================================================================

fn diamond(task_for_b: &str) -> DagWorkflow {
    DagWorkflow::new("diamond")
        .with_node(DagNode::new(text_step("a", "concat").with_input("p", json!("a"))))
        .unwrap()
        .with_node(
            DagNode::new(text_step("b", task_for_b).with_input_mapping("from_a", "a.text"))
                .depends_on("a"),
        )
        .unwrap()
        .with_node(
            DagNode::new(text_step("c", "concat").with_input_mapping("from_a", "a.text"))
                .depends_on("a"),
        )
        .unwrap()
        .with_node(
            DagNode::new(
                text_step("d", "concat")
                    .with_input_mapping("1_b", "b.text")
                    .with_input_mapping("2_c", "c.text"),
            )
            .with_dependencies(["b", "c"]),
        )
        .unwrap()
}

#[tokio::test]
async fn test_dag_diamond_joins_both_branches() {
    let swarm = swarm(&["agent-1", "agent-2", "agent-3"]).await;
    let executor = DagExecutor::new(
        connect(&swarm.network, "orchestrator").await,
        swarm.registry.clone(),
        executor_config(),
    );

    let mut workflow = diamond("concat");
    executor.execute_dag(&mut workflow).await.unwrap();

    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert_eq!(workflow.output("d").unwrap()["text"], json!("a+a"));
    assert_eq!(workflow.total_cost, 1.0);
    let d = &workflow.node("d").unwrap().state;
    for dep in ["b", "c"] {
        let dep_done = workflow.node(dep).unwrap().state.completed_at.unwrap();
        assert!(d.started_at.unwrap() >= dep_done);
    }
    assert_eq!(executor.stats().completed, 1);
}

#[tokio::test]
async fn test_dag_best_effort_marks_unreachable() {
    let swarm = swarm(&["agent-1"]).await;
    let executor = DagExecutor::new(
        connect(&swarm.network, "orchestrator").await,
        swarm.registry.clone(),
        executor_config().with_failure_policy(FailurePolicy::BestEffort),
    );

    let mut workflow = diamond("fail");
    executor.execute_dag(&mut workflow).await.unwrap();

    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert_eq!(workflow.node("b").unwrap().state.status, StepStatus::Failed);
    assert_eq!(workflow.node("c").unwrap().state.status, StepStatus::Completed);
    assert_eq!(workflow.node("d").unwrap().state.status, StepStatus::Unreachable);
    assert_eq!(workflow.error.as_deref(), Some("failed nodes: b"));
}

#[tokio::test]
async fn test_dag_fail_fast_fails_workflow() {
    let swarm = swarm(&["agent-1"]).await;
    let executor = DagExecutor::new(
        connect(&swarm.network, "orchestrator").await,
        swarm.registry.clone(),
        executor_config(),
    );

    let mut workflow = diamond("fail");
    let err = executor.execute_dag(&mut workflow).await.unwrap_err();

    assert!(matches!(err, WorkflowError::StepFailed { ref step, .. } if step == "b"));
    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert_eq!(workflow.node("d").unwrap().state.status, StepStatus::Unreachable);
    assert!(workflow.nodes.values().all(|n| n.state.status.is_terminal()));
}

#[tokio::test]
async fn test_dag_timeout_keeps_partial_results() {
    let swarm = swarm(&["agent-1"]).await;
    let executor = DagExecutor::new(
        connect(&swarm.network, "orchestrator").await,
        swarm.registry.clone(),
        executor_config(),
    );

    let mut workflow = DagWorkflow::new("slow")
        .with_timeout(Duration::from_millis(150))
        .with_node(text_step("quick", "slow").with_input("ms", json!(0)))
        .unwrap()
        .with_node(DagNode::new(text_step("sleepy", "slow").with_input("ms", json!(1_000))).depends_on("quick"))
        .unwrap();

    let err = executor.execute_dag(&mut workflow).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Timeout(_)));
    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert_eq!(workflow.node("quick").unwrap().state.status, StepStatus::Completed);
    assert!(workflow.output("quick").is_some());
    assert_eq!(workflow.node("sleepy").unwrap().state.status, StepStatus::Cancelled);
}

#[tokio::test]
async fn test_dag_status_observable_while_running() {
    let swarm = swarm(&["agent-1"]).await;
    let executor = DagExecutor::new(
        connect(&swarm.network, "orchestrator").await,
        swarm.registry.clone(),
        executor_config(),
    );

    let mut workflow = DagWorkflow::new("progress")
        .with_node(text_step("quick", "slow").with_input("ms", json!(0)))
        .unwrap()
        .with_node(DagNode::new(text_step("sleepy", "slow").with_input("ms", json!(300))).depends_on("quick"))
        .unwrap()
        .with_node(DagNode::new(text_step("last", "slow").with_input("ms", json!(0))).depends_on("sleepy"))
        .unwrap();
    let id = workflow.id.clone();

    let observe = async {
        for _ in 0..100 {
            if let Some(status) = executor.status(&id) {
                if status.step("sleepy") == Some(StepStatus::Running) {
                    return Some(status);
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        None
    };
    let (result, seen) = tokio::join!(executor.execute_dag(&mut workflow), observe);
    result.unwrap();

    let seen = seen.expect("status published while running");
    assert_eq!(seen.status, WorkflowStatus::Running);
    assert_eq!(seen.step("quick"), Some(StepStatus::Completed));
    assert_eq!(seen.step("last"), Some(StepStatus::Pending));
    assert_eq!(seen.summary.total, 3);

    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert!(executor.status(&id).is_none());
}

// ============================================================================
// Remote coordination
// ============================================================================

async fn coordination_pair(network: &InMemoryNetwork) -> (CoordinationService, CoordinationClient, CoordinationClient) {
    let authority_bus = connect(network, "authority").await;
    let service = CoordinationService::new("authority", CoordinationConfig::default());
    service.start();
    service.attach(&authority_bus);

    let a = CoordinationClient::new(connect(network, "agent-a").await, "authority")
        .with_lock_wait(Duration::from_millis(100));
    let b = CoordinationClient::new(connect(network, "agent-b").await, "authority")
        .with_lock_wait(Duration::from_millis(100));
    (service, a, b)
}

#[tokio::test]
async fn test_remote_exclusive_lock_conflict_and_release() {
    let network = InMemoryNetwork::new();
    let (service, a, b) = coordination_pair(&network).await;

    let lock = a
        .acquire_lock("db", LockType::Exclusive, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(lock.holder, "agent-a");

    let err = b
        .acquire_lock("db", LockType::Exclusive, Duration::from_secs(10))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::LockConflict { .. }));

    a.release_lock(&lock.token).await.unwrap();
    // Idempotent
    a.release_lock(&lock.token).await.unwrap();

    let lock_b = b
        .acquire_lock("db", LockType::Exclusive, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(lock_b.holder, "agent-b");
    assert_eq!(service.lock_count(), 1);
}

#[tokio::test]
async fn test_remote_state_and_barrier() {
    let network = InMemoryNetwork::new();
    let (service, a, b) = coordination_pair(&network).await;

    let created = a.update_state("progress", "done", json!(1)).await.unwrap();
    assert_eq!(created.version, 1);
    let stale = b
        .set_state("progress", serde_json::Map::new(), 0)
        .await
        .unwrap_err();
    assert!(matches!(stale, CoordinationError::VersionConflict { .. }));
    assert_eq!(service.get_state("progress").await.unwrap().unwrap().updated_by, "agent-a");

    let (ra, rb) = tokio::join!(
        a.wait_at_barrier("phase-1", 2, Duration::from_secs(2)),
        b.wait_at_barrier("phase-1", 2, Duration::from_secs(2)),
    );
    assert!(ra.is_ok());
    assert!(rb.is_ok());
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_config_file_drives_components() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "bus:\n  request_timeout: 1500\ncoordination:\n  lock_wait_timeout: 0\nexecutor:\n  failure_policy: best_effort\n  default_step_timeout: 2500"
    )
    .unwrap();

    let config = SwarmConfig::from_file(file.path()).unwrap();
    assert_eq!(config.bus.request_timeout, Duration::from_millis(1500));
    assert_eq!(config.coordination.lock_wait_timeout, Duration::ZERO);
    assert_eq!(config.executor.failure_policy, FailurePolicy::BestEffort);
    assert_eq!(config.executor.default_step_timeout, Duration::from_millis(2500));
}
