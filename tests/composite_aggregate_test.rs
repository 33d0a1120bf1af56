//! Composite pipelines, aggregate strategies, and signal dispatch.

mod helpers;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use flowcore::adapters::sqlite::{open_in_memory, SqliteMetadataStore, SqliteStateRepository};
use flowcore::adapters::template::PathTemplateEngine;
use flowcore::domain::errors::{OrchResult, OrchestrationError};
use flowcore::domain::models::{Signal, TaskStatus, WorkflowConfig, WorkflowState};
use flowcore::domain::ports::{SignalDispatcher, StateRepository};
use flowcore::services::{ActivityAdapter, OrchestratorContext};

use helpers::{create_input, response_input, setup_adapter, TestRuntime};

#[tokio::test]
async fn test_composite_injects_previous_output() {
    let workflow_config = WorkflowConfig::from_yaml(
        r#"
id: pipeline
tasks:
  - id: steps
    type: composite
    tasks:
      - id: one
        type: basic
        action: one
      - id: two
        type: basic
        action: two
        with:
          prev: "{{ previous.output.n }}"
"#,
    )
    .unwrap();
    let workflow_state = WorkflowState::new("pipeline", "wf-c-1");

    let runtime = TestRuntime::new(setup_adapter().await);
    let input = create_input(&workflow_state, &workflow_config, workflow_config.task_by_id("steps").unwrap());

    let final_state = runtime
        .execute(&input, &|config, state| match config.action.as_str() {
            "one" => Ok(json!({"n": 1})),
            "two" => {
                let prev = state.input.as_ref().unwrap()["prev"].as_i64().unwrap();
                Ok(json!({"n": prev + 1}))
            }
            other => panic!("unexpected action {other}"),
        })
        .await;

    assert_eq!(final_state.status, TaskStatus::Success);
    // The pipeline's output is the last step's output
    assert_eq!(final_state.output, Some(json!({"n": 2})));

    // Step two received step one's output through `previous.output`
    let states = runtime.states().list_states("wf-c-1").await.unwrap();
    let two = states.iter().find(|s| s.task_id == "two").unwrap();
    assert_eq!(two.input.as_ref().unwrap()["prev"], json!(1));
}

#[tokio::test]
async fn test_composite_step_failure_fails_pipeline_by_default() {
    let workflow_config = WorkflowConfig::from_yaml(
        r#"
id: strict
tasks:
  - id: steps
    type: composite
    tasks:
      - id: one
        type: basic
        action: one
      - id: two
        type: basic
        action: two
"#,
    )
    .unwrap();
    let workflow_state = WorkflowState::new("strict", "wf-c-2");

    let runtime = TestRuntime::new(setup_adapter().await);
    let input = create_input(&workflow_state, &workflow_config, workflow_config.task_by_id("steps").unwrap());

    let final_state = runtime
        .execute(&input, &|config, _state| match config.action.as_str() {
            "one" => Err(flowcore::domain::models::TaskErrorInfo::new("step one broke")),
            other => panic!("step {other} must not run after a failure"),
        })
        .await;

    assert_eq!(final_state.status, TaskStatus::Failed);

    // Only the failed step ever ran
    let states = runtime.states().list_states("wf-c-2").await.unwrap();
    assert!(states.iter().any(|s| s.task_id == "one"));
    assert!(!states.iter().any(|s| s.task_id == "two"));
}

#[tokio::test]
async fn test_composite_tolerated_failure_continues_with_previous_unchanged() {
    let workflow_config = WorkflowConfig::from_yaml(
        r#"
id: lenient
tasks:
  - id: steps
    type: composite
    error_on_fail: false
    tasks:
      - id: one
        type: basic
        action: one
      - id: two
        type: basic
        action: two
      - id: three
        type: basic
        action: three
        with:
          prev: "{{ previous.output.n }}"
"#,
    )
    .unwrap();
    let workflow_state = WorkflowState::new("lenient", "wf-c-3");

    let runtime = TestRuntime::new(setup_adapter().await);
    let input = create_input(&workflow_state, &workflow_config, workflow_config.task_by_id("steps").unwrap());

    let final_state = runtime
        .execute(&input, &|config, _state| match config.action.as_str() {
            "one" => Ok(json!({"n": 7})),
            "two" => Err(flowcore::domain::models::TaskErrorInfo::new("tolerated")),
            "three" => Ok(json!({"n": 8})),
            other => panic!("unexpected action {other}"),
        })
        .await;

    // The pipeline completes despite the failed middle step
    assert_eq!(final_state.status, TaskStatus::Success);

    // Step three saw step one's output: `previous` was unchanged by the
    // failed step
    let states = runtime.states().list_states("wf-c-3").await.unwrap();
    let three = states.iter().find(|s| s.task_id == "three").unwrap();
    assert_eq!(three.input.as_ref().unwrap()["prev"], json!(7));
}

async fn aggregate_fixture(strategy: &str, reducer: Option<&str>) -> (ActivityAdapter, WorkflowConfig, WorkflowState) {
    let reducer_line = reducer.map(|r| format!("    reducer: {r}\n")).unwrap_or_default();
    let workflow_config = WorkflowConfig::from_yaml(&format!(
        r#"
id: gathered
tasks:
  - id: left
    type: basic
    action: left
  - id: right
    type: basic
    action: right
  - id: gather
    type: aggregate
    strategy: {strategy}
{reducer_line}    sources:
      - left
      - right
"#,
    ))
    .unwrap();
    let workflow_state = WorkflowState::new("gathered", format!("wf-agg-{strategy}"));
    let adapter = setup_adapter().await;

    // Complete both sources first
    for (task_id, output) in [("left", json!({"k": 1, "only_left": true})), ("right", json!({"k": 2}))] {
        let input = create_input(&workflow_state, &workflow_config, workflow_config.task_by_id(task_id).unwrap());
        let state = adapter.create_task_state(&input).await.unwrap();
        let mut response = response_input(&input, state);
        response.output = Some(output);
        adapter.handle_task_response(&response).await.unwrap();
    }
    (adapter, workflow_config, workflow_state)
}

async fn run_aggregate(
    adapter: &ActivityAdapter,
    workflow_config: &WorkflowConfig,
    workflow_state: &WorkflowState,
) -> OrchResult<Value> {
    let input = create_input(workflow_state, workflow_config, workflow_config.task_by_id("gather").unwrap());
    let state = adapter.create_task_state(&input).await?;
    let response = response_input(&input, state);
    let envelope = adapter.handle_task_response(&response).await?;
    Ok(envelope.state.output.unwrap_or(Value::Null))
}

#[tokio::test]
async fn test_aggregate_merge_last_writer_wins() {
    let (adapter, config, state) = aggregate_fixture("merge", None).await;
    let output = run_aggregate(&adapter, &config, &state).await.unwrap();
    assert_eq!(output, json!({"k": 2, "only_left": true}));
}

#[tokio::test]
async fn test_aggregate_concat_in_source_order() {
    let (adapter, config, state) = aggregate_fixture("concat", None).await;
    let output = run_aggregate(&adapter, &config, &state).await.unwrap();
    assert_eq!(output["k"], json!([1, 2]));
    assert_eq!(output["only_left"], json!([true]));
}

#[tokio::test]
async fn test_aggregate_custom_reducer() {
    let (adapter, config, state) = aggregate_fixture("custom", Some("sum_k")).await;
    adapter.context().reducers.register("sum_k", |outputs: &[Value]| {
        let sum: i64 = outputs.iter().filter_map(|o| o["k"].as_i64()).sum();
        json!({"sum": sum})
    });

    let output = run_aggregate(&adapter, &config, &state).await.unwrap();
    assert_eq!(output, json!({"sum": 3}));
}

#[tokio::test]
async fn test_aggregate_unknown_reducer_is_rejected() {
    let (adapter, config, state) = aggregate_fixture("custom", Some("nope")).await;
    let err = run_aggregate(&adapter, &config, &state).await.unwrap_err();
    assert!(matches!(err, OrchestrationError::InvalidInput(_)));
}

/// Dispatcher recording deliveries, failing a designated target.
struct RecordingDispatcher {
    delivered: Mutex<Vec<String>>,
    failing_target: Option<String>,
}

#[async_trait]
impl SignalDispatcher for RecordingDispatcher {
    async fn dispatch(&self, target: &str, signal: &Signal) -> OrchResult<()> {
        if self.failing_target.as_deref() == Some(target) {
            return Err(OrchestrationError::ExecutionFailed(format!(
                "target {target} unreachable"
            )));
        }
        self.delivered
            .lock()
            .unwrap()
            .push(format!("{}:{}", target, signal.name));
        Ok(())
    }
}

async fn signal_adapter(failing_target: Option<&str>) -> (ActivityAdapter, Arc<RecordingDispatcher>) {
    let pool = open_in_memory().await.unwrap();
    let dispatcher = Arc::new(RecordingDispatcher {
        delivered: Mutex::new(Vec::new()),
        failing_target: failing_target.map(str::to_string),
    });
    let ctx = OrchestratorContext::new(
        Arc::new(SqliteStateRepository::new(pool.clone())),
        Arc::new(SqliteMetadataStore::new(pool)),
        Arc::new(PathTemplateEngine::new()),
    )
    .with_dispatcher(dispatcher.clone());
    (ActivityAdapter::new(ctx), dispatcher)
}

fn signal_workflow(fail_on_error: bool) -> WorkflowConfig {
    WorkflowConfig::from_yaml(&format!(
        r#"
id: notify
tasks:
  - id: broadcast
    type: signal
    action: order.completed
    fail_on_error: {fail_on_error}
    with:
      order_id: o-1
    targets:
      - billing
      - shipping
"#,
    ))
    .unwrap()
}

#[tokio::test]
async fn test_signal_dispatch_records_per_target_results() {
    let (adapter, dispatcher) = signal_adapter(Some("shipping")).await;
    let workflow_config = signal_workflow(false);
    let workflow_state = WorkflowState::new("notify", "wf-s-1");

    let input = create_input(&workflow_state, &workflow_config, workflow_config.task_by_id("broadcast").unwrap());
    let state = adapter.create_task_state(&input).await.unwrap();

    let response = response_input(&input, state);
    let envelope = adapter.handle_task_response(&response).await.unwrap();

    // One failed delivery does not fail the task
    assert_eq!(envelope.state.status, TaskStatus::Success);
    let output = envelope.state.output.as_ref().unwrap();
    assert_eq!(output["signal"], "order.completed");
    assert_eq!(output["delivered"], 1);
    let results = output["results"].as_array().unwrap();
    assert_eq!(results[0], json!({"target": "billing", "ok": true}));
    assert_eq!(results[1]["target"], "shipping");
    assert_eq!(results[1]["ok"], false);

    assert_eq!(*dispatcher.delivered.lock().unwrap(), vec!["billing:order.completed"]);
}

#[tokio::test]
async fn test_signal_dispatch_fail_on_error() {
    let (adapter, _dispatcher) = signal_adapter(Some("shipping")).await;
    let workflow_config = signal_workflow(true);
    let workflow_state = WorkflowState::new("notify", "wf-s-2");

    let input = create_input(&workflow_state, &workflow_config, workflow_config.task_by_id("broadcast").unwrap());
    let state = adapter.create_task_state(&input).await.unwrap();
    let exec_id = state.exec_id.clone();

    let response = response_input(&input, state);
    // Failure with no error transition surfaces after persistence
    let err = adapter.handle_task_response(&response).await.unwrap_err();
    assert!(matches!(err, OrchestrationError::NoErrorTransition { .. }));

    let after = adapter.context().states.get_state(&exec_id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Failed);
    assert!(after.error.unwrap().message.contains("1 target(s)"));
}
