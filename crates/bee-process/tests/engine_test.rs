// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine behaviour tests: trace order, handlers and cancellation.

use std::collections::HashSet;
use std::time::Duration;

use bee_process::{ActivityRole, Definitions, Instance, Process, ProcessError, Trace};
use tokio_util::sync::CancellationToken;

/// Drive an instance to the end, failing the activities whose id is listed.
/// Returns the activity ids in dispatch order plus whether an error trace was seen.
async fn drive(source: &str, failing: &[&str]) -> (Vec<String>, bool, bee_process::Result<()>) {
    let process = Process::from_yaml(source).unwrap();
    let mut instance = Instance::new(Definitions::compile(&process).unwrap());
    let mut traces = instance.start(CancellationToken::new()).unwrap();

    let failing: HashSet<&str> = failing.iter().copied().collect();
    let mut activities = Vec::new();
    let mut errored = false;

    while let Some(trace) = traces.recv().await {
        match trace {
            Trace::Activity(activity) => {
                activities.push(activity.element.id.clone());
                if failing.contains(activity.element.id.as_str()) {
                    activity.fail("boom");
                } else {
                    activity.complete();
                }
            }
            Trace::Error(_) => {
                errored = true;
                break;
            }
            Trace::CeaseFlow(_) => break,
            _ => {}
        }
    }

    let result = instance.wait().await;
    (activities, errored, result)
}

#[tokio::test]
async fn test_linear_process_ends_with_cease_flow() {
    let (activities, errored, result) = drive(
        r#"
name: linear
hosts: [host1]
tasks:
  - name: one
    action: ping
  - name: two
    action: ping
"#,
        &[],
    )
    .await;

    assert_eq!(activities, vec!["task-0", "task-1"]);
    assert!(!errored);
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_uncaught_failure_emits_error_trace() {
    let (activities, errored, result) = drive(
        r#"
name: failing
tasks:
  - name: one
    action: ping
  - name: two
    action: ping
"#,
        &["task-0"],
    )
    .await;

    assert_eq!(activities, vec!["task-0"]);
    assert!(errored);
    assert!(matches!(
        result,
        Err(ProcessError::Activity { element_id, .. }) if element_id == "task-0"
    ));
}

#[tokio::test]
async fn test_catch_handles_failure_and_flow_continues() {
    let (activities, errored, result) = drive(
        r#"
name: caught
tasks:
  - name: one
    action: ping
    catch: rescue
    finish: cleanup
  - name: two
    action: ping
handlers:
  - name: rescue
    action: log
  - name: cleanup
    action: log
"#,
        &["task-0"],
    )
    .await;

    assert_eq!(
        activities,
        vec!["task-0", "handler-0", "handler-1", "task-1"]
    );
    assert!(!errored);
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_finish_runs_even_when_failure_is_uncaught() {
    let (activities, errored, _) = drive(
        r#"
name: finishing
tasks:
  - name: one
    action: ping
    finish: cleanup
handlers:
  - name: cleanup
    action: log
"#,
        &["task-0"],
    )
    .await;

    assert_eq!(activities, vec!["task-0", "handler-0"]);
    assert!(errored);
}

#[tokio::test]
async fn test_notified_handlers_run_once_in_declaration_order() {
    let (activities, _, result) = drive(
        r#"
name: notifying
tasks:
  - name: one
    action: ping
    notify: [second, first]
  - name: two
    action: ping
    notify: [first]
  - name: three
    action: ping
    notify: [unused]
    catch: unused
handlers:
  - name: first
    action: log
  - name: second
    action: log
  - name: unused
    action: log
"#,
        &["task-2"],
    )
    .await;

    // task-2 failed and was caught by `unused`, so its notify does not count.
    assert_eq!(
        activities,
        vec!["task-0", "task-1", "task-2", "handler-2", "handler-0", "handler-1"]
    );
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_child_process_tasks_are_dispatched_in_order() {
    let (activities, _, result) = drive(
        r#"
name: nested
hosts: [h1]
tasks:
  - kind: process
    name: child
    tasks:
      - name: a
        action: ping
      - name: b
        action: ping
  - kind: service
    name: c
    action: ping
"#,
        &[],
    )
    .await;

    assert_eq!(activities, vec!["task-0-0", "task-0-1", "task-1"]);
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_handler_activities_carry_handler_role() {
    let process = Process::from_yaml(
        r#"
name: roles
tasks:
  - name: one
    action: ping
    notify: [after]
handlers:
  - name: after
    action: log
"#,
    )
    .unwrap();
    let mut instance = Instance::new(Definitions::compile(&process).unwrap());
    let mut traces = instance.start(CancellationToken::new()).unwrap();

    let mut roles = Vec::new();
    while let Some(trace) = traces.recv().await {
        match trace {
            Trace::Activity(activity) => {
                roles.push(activity.role);
                activity.complete();
            }
            Trace::CeaseFlow(_) => break,
            _ => {}
        }
    }
    instance.wait().await.unwrap();

    assert_eq!(roles, vec![ActivityRole::Task, ActivityRole::Handler]);
}

#[tokio::test]
async fn test_cancel_stops_a_pending_activity() {
    let process = Process::from_yaml("name: slow\ntasks:\n  - name: one\n    action: ping\n").unwrap();
    let mut instance = Instance::new(Definitions::compile(&process).unwrap());
    let cancel = CancellationToken::new();
    let mut traces = instance.start(cancel.clone()).unwrap();

    // Hold the activity without answering it, then cancel.
    let mut pending = None;
    while let Some(trace) = traces.recv().await {
        if let Trace::Activity(activity) = trace {
            pending = Some(activity);
            break;
        }
    }
    assert!(pending.is_some());
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), instance.wait())
        .await
        .unwrap();
    assert!(matches!(result, Err(ProcessError::Cancelled)));
}

#[tokio::test]
async fn test_instance_cannot_start_twice() {
    let process = Process::from_yaml("name: once\n").unwrap();
    let mut instance = Instance::new(Definitions::compile(&process).unwrap());
    let _traces = instance.start(CancellationToken::new()).unwrap();
    assert!(matches!(
        instance.start(CancellationToken::new()),
        Err(ProcessError::AlreadyStarted)
    ));
}

#[tokio::test]
async fn test_dropped_activity_counts_as_failure() {
    let (activities, errored, result) = {
        let process =
            Process::from_yaml("name: dropped\ntasks:\n  - name: one\n    action: ping\n").unwrap();
        let mut instance = Instance::new(Definitions::compile(&process).unwrap());
        let mut traces = instance.start(CancellationToken::new()).unwrap();
        let mut activities = Vec::new();
        let mut errored = false;
        while let Some(trace) = traces.recv().await {
            match trace {
                Trace::Activity(activity) => {
                    activities.push(activity.element.id.clone());
                    drop(activity);
                }
                Trace::Error(_) => {
                    errored = true;
                    break;
                }
                Trace::CeaseFlow(_) => break,
                _ => {}
            }
        }
        (activities, errored, instance.wait().await)
    };

    assert_eq!(activities, vec!["task-0"]);
    assert!(errored);
    assert!(result.is_err());
}

#[tokio::test]
async fn test_nested_child_process_notifies_root_handlers() {
    let (activities, errored, result) = drive(
        r#"
name: layered
hosts: [h1]
tasks:
  - kind: process
    name: outer
    tasks:
      - kind: process
        name: inner
        tasks:
          - name: deepest
            action: ping
            notify: [reload]
      - name: sibling
        action: ping
handlers:
  - name: reload
    action: ping
"#,
        &[],
    )
    .await;

    assert_eq!(activities, vec!["task-0-0-0", "task-0-1", "handler-0"]);
    assert!(!errored);
    assert!(result.is_ok());
}

#[test]
fn test_duplicate_task_ids_do_not_compile() {
    let process = Process::from_yaml(
        r#"
name: twice
hosts: [h1]
tasks:
  - id: x
    name: first
    action: ping
  - id: x
    name: second
    action: ping
"#,
    )
    .unwrap();

    assert!(matches!(
        Definitions::compile(&process),
        Err(ProcessError::Invalid(_))
    ));
}

#[test]
fn test_task_id_colliding_with_end_event_does_not_compile() {
    let process = Process::from_yaml(
        "name: twice\nhosts: [h1]\ntasks:\n  - id: twice-end\n    name: first\n    action: ping\n",
    )
    .unwrap();

    assert!(matches!(
        Definitions::compile(&process),
        Err(ProcessError::Invalid(_))
    ));
}
