//! End-to-end orchestration scenarios driven through the activity adapter.

mod helpers;

use serde_json::{json, Value};

use flowcore::domain::models::{
    Signal, TaskErrorInfo, TaskStatus, TaskType, WorkflowConfig, WorkflowState,
};
use flowcore::services::context::ContextArgs;
use flowcore::OrchestrationError;

use helpers::{create_input, response_input, setup_adapter, TestRuntime};

/// Collection → composite → parallel → basic, two items.
#[tokio::test]
async fn test_nested_tree_aggregates_per_item_results() {
    let workflow_config = WorkflowConfig::from_yaml(
        r#"
id: pipeline
tasks:
  - id: process-items
    type: collection
    items: ["item1", "item2"]
    task:
      id: process
      type: composite
      tasks:
        - id: stage
          type: parallel
          tasks:
            - id: work
              type: basic
              action: produce
              with:
                item: "{{ parent.input.item }}"
"#,
    )
    .unwrap();
    let workflow_state = WorkflowState::new("pipeline", "wf-exec-1");

    let runtime = TestRuntime::new(setup_adapter().await);
    let input = create_input(
        &workflow_state,
        &workflow_config,
        workflow_config.task_by_id("process-items").unwrap(),
    );

    let final_state = runtime
        .execute(&input, &|config, state| {
            assert_eq!(config.action, "produce");
            let item = state
                .input
                .as_ref()
                .and_then(|i| i.get("item"))
                .cloned()
                .unwrap_or(Value::Null);
            Ok(json!({"result": "success", "item": item, "level": "basic"}))
        })
        .await;

    assert_eq!(final_state.status, TaskStatus::Success);

    // Per-item results in index order, each carrying the basic output
    let results = final_state.output.as_ref().unwrap()["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["results"][0]["item"], "item1");
    assert_eq!(results[0]["results"][0]["level"], "basic");
    assert_eq!(results[1]["results"][0]["item"], "item2");

    // Parent traversal from the basic task sees four frames:
    // basic -> parallel -> composite -> collection.
    use flowcore::domain::ports::StateRepository;
    let states = runtime.states().list_states("wf-exec-1").await.unwrap();
    let basic_state = states.iter().find(|s| s.task_id == "work-0").unwrap();
    let basic_config = workflow_config.find_task("work").unwrap();

    let ctx = runtime
        .adapter
        .context()
        .context_builder
        .build(&ContextArgs {
            workflow_state: &workflow_state,
            workflow_config: &workflow_config,
            task_config: basic_config,
            states: &states,
            current_input: None,
            current_state: Some(basic_state),
        })
        .unwrap();

    let mut frames = vec![ctx.variables["task"]["id"].as_str().unwrap().to_string()];
    let mut cursor = ctx.variables.get("parent");
    while let Some(frame) = cursor {
        frames.push(frame["id"].as_str().unwrap_or_default().to_string());
        cursor = frame.get("parent");
    }
    assert_eq!(frames.len(), 4, "chain was {frames:?}");
    assert_eq!(frames[0], "work");
    assert_eq!(frames[1], "stage");
    assert_eq!(frames[2], "process");
    assert_eq!(frames[3], "process-items");
}

/// Parallel with fail_fast: the first failure fails the parent and cancels
/// the siblings.
#[tokio::test]
async fn test_parallel_fail_fast_cancels_siblings() {
    let workflow_config = WorkflowConfig::from_yaml(
        r#"
id: guarded
tasks:
  - id: guard
    type: parallel
    strategy: fail_fast
    tasks:
      - id: slow
        type: basic
        action: slow
      - id: doomed
        type: basic
        action: doomed
      - id: other
        type: basic
        action: other
"#,
    )
    .unwrap();
    let workflow_state = WorkflowState::new("guarded", "wf-exec-2");

    let adapter = setup_adapter().await;
    let input = create_input(
        &workflow_state,
        &workflow_config,
        workflow_config.task_by_id("guard").unwrap(),
    );
    let parent = adapter.create_task_state(&input).await.unwrap();
    let children = adapter.create_child_states(&input, &parent.exec_id).await.unwrap();
    assert_eq!(children.len(), 3);

    // Child index 1 fails while 0 and 2 are still pending
    let doomed = &children[1];
    let mut response = response_input(
        &create_input(&workflow_state, &workflow_config, &doomed.task_config),
        doomed.state.clone(),
    );
    response.execution_error = Some(TaskErrorInfo::new("boom"));

    // The failure has no error transition; the wrapped cause surfaces after
    // the state and parent updates are persisted.
    let err = adapter.handle_task_response(&response).await.unwrap_err();
    assert!(matches!(err, OrchestrationError::NoErrorTransition { .. }));

    use flowcore::domain::ports::StateRepository;
    let states = &adapter.context().states;

    let parent_after = states.get_state(&parent.exec_id).await.unwrap();
    assert_eq!(parent_after.status, TaskStatus::Failed);

    let errors = parent_after.output.as_ref().unwrap()["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["task_id"], "doomed-1");
    assert_eq!(errors[0]["error"], "boom");

    // Siblings were canceled, the failed child kept its status
    let siblings = states.list_children(&parent.exec_id).await.unwrap();
    for child in siblings {
        match child.task_id.as_str() {
            "doomed-1" => assert_eq!(child.status, TaskStatus::Failed),
            _ => assert_eq!(child.status, TaskStatus::Canceled),
        }
    }
}

/// Collection filter: only items passing the filter produce children.
#[tokio::test]
async fn test_collection_filter_limits_children() {
    let workflow_config = WorkflowConfig::from_yaml(
        r#"
id: filtered
tasks:
  - id: fan-out
    type: collection
    items: [{"v": 1}, {"v": 2}, {"v": 3}]
    filter: "item.v > 1"
    task:
      id: handle
      type: basic
      action: handle
      with:
        value: "{{ item.v }}"
"#,
    )
    .unwrap();
    let workflow_state = WorkflowState::new("filtered", "wf-exec-3");

    let runtime = TestRuntime::new(setup_adapter().await);
    let input = create_input(
        &workflow_state,
        &workflow_config,
        workflow_config.task_by_id("fan-out").unwrap(),
    );

    let parent = runtime.adapter.create_task_state(&input).await.unwrap();

    // Prepared metadata records both counts
    use flowcore::domain::ports::MetadataStoreExt;
    use flowcore::services::orchestrators::{children_key, ChildrenMetadata};
    let meta: ChildrenMetadata = runtime
        .adapter
        .context()
        .metadata
        .load_as(&children_key(&parent.exec_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(meta.original_count, Some(3));
    assert_eq!(meta.filtered_count, Some(2));
    assert_eq!(meta.count, 2);

    let children = runtime.adapter.create_child_states(&input, &parent.exec_id).await.unwrap();
    assert_eq!(children.len(), 2);
    let values: Vec<_> = children
        .iter()
        .map(|c| c.state.input.as_ref().unwrap()["value"].clone())
        .collect();
    assert_eq!(values, vec![json!(2), json!(3)]);

    // Drive both children, then the parent's own response
    for child in &children {
        let child_input = create_input(&workflow_state, &workflow_config, &child.task_config);
        let mut response = response_input(&child_input, child.state.clone());
        response.output = Some(json!({"handled": child.state.input.as_ref().unwrap()["value"]}));
        runtime.adapter.handle_task_response(&response).await.unwrap();
    }

    use flowcore::domain::ports::StateRepository;
    let parent_after = runtime.states().get_state(&parent.exec_id).await.unwrap();
    assert_eq!(parent_after.status, TaskStatus::Success);
    let results = parent_after.output.as_ref().unwrap()["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["handled"], 2);
    assert_eq!(results[1]["handled"], 3);
}

/// A wait task rejects a mismatched signal and stays parked.
#[tokio::test]
async fn test_wait_task_rejects_wrong_signal() {
    let workflow_config = WorkflowConfig::from_yaml(
        r#"
id: waiting
tasks:
  - id: await-payment
    type: wait
    wait_for: order.paid
"#,
    )
    .unwrap();
    let workflow_state = WorkflowState::new("waiting", "wf-exec-4");

    let adapter = setup_adapter().await;
    let input = create_input(
        &workflow_state,
        &workflow_config,
        workflow_config.task_by_id("await-payment").unwrap(),
    );
    let state = adapter.create_task_state(&input).await.unwrap();
    assert_eq!(state.status, TaskStatus::Waiting);

    let mut response = response_input(&input, state.clone());
    response.signal = Some(Signal::new("order.shipped"));
    let err = adapter.handle_task_response(&response).await.unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("order.paid"), "missing expected name: {msg}");
    assert!(msg.contains("order.shipped"), "missing actual name: {msg}");

    use flowcore::domain::ports::StateRepository;
    let after = adapter.context().states.get_state(&state.exec_id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Waiting);

    // The matching signal releases the task
    let mut payload = serde_json::Map::new();
    payload.insert("amount".to_string(), json!(99));
    let mut response = response_input(&input, after);
    response.signal = Some(Signal::new("order.paid").with_payload(payload));
    let envelope = adapter.handle_task_response(&response).await.unwrap();
    assert_eq!(envelope.state.status, TaskStatus::Success);
    let output = envelope.state.output.as_ref().unwrap();
    assert_eq!(output["signal"]["amount"], 99);
    assert!(output["signal_received_at"].is_string());
}

/// Output-error detection fails a task that completed without a thrown
/// execution error.
#[tokio::test]
async fn test_output_error_detection_walks_error_transition() {
    let workflow_config = WorkflowConfig::from_yaml(
        r#"
id: quota
tasks:
  - id: consume
    type: basic
    action: consume
    on_error:
      next: cleanup
  - id: cleanup
    type: basic
    action: cleanup
"#,
    )
    .unwrap();
    let workflow_state = WorkflowState::new("quota", "wf-exec-5");

    let adapter = setup_adapter().await;
    let input = create_input(
        &workflow_state,
        &workflow_config,
        workflow_config.task_by_id("consume").unwrap(),
    );
    let state = adapter.create_task_state(&input).await.unwrap();

    let mut response = response_input(&input, state);
    response.output = Some(json!({"success": false, "error": "quota"}));
    let envelope = adapter.handle_task_response(&response).await.unwrap();

    assert_eq!(envelope.state.status, TaskStatus::Failed);
    assert_eq!(envelope.state.error.as_ref().unwrap().message, "task output error: quota");
    assert_eq!(envelope.response.next_task.as_deref(), Some("cleanup"));
}

/// A cycle in the parent linkage yields a bounded chain with an in-band
/// marker frame.
#[tokio::test]
async fn test_parent_chain_cycle_is_marked() {
    use flowcore::domain::models::TaskState;
    use flowcore::domain::ports::StateRepository;
    use flowcore::services::context::PARENT_CYCLE_ERROR;
    use flowcore::services::limits;

    let workflow_config = WorkflowConfig::from_yaml(
        r#"
id: cyclic
tasks:
  - id: a
    type: basic
    action: a
  - id: b
    type: basic
    action: b
  - id: c
    type: basic
    action: c
"#,
    )
    .unwrap();
    let workflow_state = WorkflowState::new("cyclic", "wf-exec-6");

    let adapter = setup_adapter().await;
    let states_repo = &adapter.context().states;

    // Parent linkage a -> c, b -> a, c -> b (a cycle)
    let mut a = TaskState::new("a", "cyclic", "wf-exec-6", TaskType::Basic);
    a.exec_id = "exec-a".to_string();
    let mut b = TaskState::new("b", "cyclic", "wf-exec-6", TaskType::Basic);
    b.exec_id = "exec-b".to_string();
    let mut c = TaskState::new("c", "cyclic", "wf-exec-6", TaskType::Basic);
    c.exec_id = "exec-c".to_string();
    a.parent_exec_id = Some("exec-c".to_string());
    b.parent_exec_id = Some("exec-a".to_string());
    c.parent_exec_id = Some("exec-b".to_string());
    for state in [&a, &b, &c] {
        states_repo.save_state(state).await.unwrap();
    }

    let states = states_repo.list_states("wf-exec-6").await.unwrap();
    let ctx = adapter
        .context()
        .context_builder
        .build(&ContextArgs {
            workflow_state: &workflow_state,
            workflow_config: &workflow_config,
            task_config: workflow_config.task_by_id("c").unwrap(),
            states: &states,
            current_input: None,
            current_state: Some(&c),
        })
        .unwrap();

    let mut frames = Vec::new();
    let mut cursor = ctx.variables.get("parent");
    let mut saw_marker = false;
    while let Some(frame) = cursor {
        frames.push(frame["id"].as_str().unwrap_or_default().to_string());
        if frame.get("error").and_then(Value::as_str) == Some(PARENT_CYCLE_ERROR) {
            saw_marker = true;
        }
        cursor = frame.get("parent");
    }

    // Chain: b, a, then the revisited c as a marker
    assert_eq!(frames, vec!["b", "a", "c"]);
    assert!(saw_marker);
    // Including the task itself, the chain stays within the depth bound
    assert!(frames.len() + 1 <= limits::get().max_parent_depth + 1);
}
