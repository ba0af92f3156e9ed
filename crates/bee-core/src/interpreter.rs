// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process interpreter.
//!
//! Feeds a process through the engine in `bee-process` and dispatches every
//! activity onto the execution plane:
//!
//! | Trace | Action |
//! |-------|--------|
//! | `Flow` | ignored |
//! | `Visit` | logged |
//! | `Activity` | `execute(host, task.shell())` on every host, concurrently |
//! | `Error` | stop, return the failure |
//! | `CeaseFlow` | stop |

use std::sync::Arc;

use async_trait::async_trait;
use bee_process::{ActivityTrace, Definitions, Instance, Process, ProcessError, Trace};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::error::{Error, Result};
use crate::runtime::Runtime;

/// Runs a module command on a host.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, host: &str, shell: &str, cancel: CancellationToken) -> Result<Vec<u8>>;
}

#[async_trait]
impl Executor for Runtime {
    async fn execute(&self, host: &str, shell: &str, cancel: CancellationToken) -> Result<Vec<u8>> {
        Runtime::execute(self, host, shell, cancel).await
    }
}

/// Run `process` to completion.
///
/// Cancelling `cancel` stops the engine and every in-flight execute; the
/// call then returns [`Error::Timeout`].
#[instrument(skip_all, fields(process = %process.id))]
pub async fn play(process: &Process, executor: Arc<dyn Executor>, cancel: CancellationToken) -> Result<()> {
    let definitions = Definitions::compile(process)?;
    let mut instance = Instance::new(definitions);
    let engine_cancel = cancel.child_token();
    let mut traces = instance.start(engine_cancel.clone())?;

    let outcome = loop {
        let trace = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Err(Error::Timeout),
            trace = traces.recv() => trace,
        };
        let Some(trace) = trace else {
            break Ok(());
        };

        match trace {
            Trace::Flow(_) => {}
            Trace::Visit(visit) => debug!(element = %visit.element_id, name = %visit.name, "visit"),
            Trace::Activity(activity) => {
                dispatch(activity, &process.hosts, executor.as_ref(), &cancel).await;
            }
            Trace::Error(trace) => {
                error!(element = %trace.element_id, error = %trace.error, "process failed");
                break Err(ProcessError::Activity {
                    element_id: trace.element_id,
                    message: trace.error,
                }
                .into());
            }
            Trace::CeaseFlow(_) => break Ok(()),
        }
    };
    drop(traces);

    match outcome {
        Ok(()) => {
            instance.wait().await?;
            info!("process finished");
            Ok(())
        }
        Err(e) => {
            engine_cancel.cancel();
            if let Err(wait) = instance.wait().await {
                debug!(error = %wait, "engine stopped");
            }
            Err(e)
        }
    }
}

/// Execute one activity on its hosts and answer the engine.
async fn dispatch(
    activity: ActivityTrace,
    default_hosts: &[String],
    executor: &dyn Executor,
    cancel: &CancellationToken,
) {
    let task = match activity.element.task() {
        Ok(Some(task)) => task,
        Ok(None) => {
            activity.complete();
            return;
        }
        Err(e) => {
            activity.fail(e.to_string());
            return;
        }
    };

    let hosts = if task.hosts.is_empty() {
        default_hosts
    } else {
        &task.hosts
    };
    if hosts.is_empty() {
        activity.fail(format!("task '{}' has no hosts", task.name));
        return;
    }

    let shell = task.shell();
    info!(task = %task.name, %shell, hosts = hosts.len(), "dispatching activity");
    let shell = shell.as_str();
    let results = join_all(
        hosts
            .iter()
            .map(|host| async move { (host, executor.execute(host, shell, cancel.clone()).await) }),
    )
    .await;

    let mut failure = None;
    for (host, result) in results {
        match result {
            Ok(output) => debug!(%host, output = %String::from_utf8_lossy(&output).trim_end(), "host done"),
            Err(e) => {
                error!(%host, task = %task.name, error = %e, "host failed");
                failure.get_or_insert_with(|| format!("{}: {}", host, e));
            }
        }
    }
    match failure {
        Some(message) => activity.fail(message),
        None => activity.complete(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, String)>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl Executor for Recorder {
        async fn execute(&self, host: &str, shell: &str, _cancel: CancellationToken) -> Result<Vec<u8>> {
            self.calls.lock().unwrap().push((host.to_string(), shell.to_string()));
            if self.fail_on.as_deref() == Some(host) {
                return Err(Error::Exit {
                    code: 1,
                    stderr: "boom".to_string(),
                });
            }
            Ok(b"pong\n".to_vec())
        }
    }

    #[tokio::test]
    async fn test_task_hosts_default_to_process_hosts() {
        let process = Process::from_yaml(
            "name: deploy\nhosts: [web1, web2]\ntasks:\n  - name: ping\n    action: ping\n    args:\n      data: hi\n",
        )
        .unwrap();
        let recorder = Arc::new(Recorder::default());
        play(&process, recorder.clone(), CancellationToken::new()).await.unwrap();

        let mut calls = recorder.calls.lock().unwrap().clone();
        calls.sort();
        assert_eq!(
            calls,
            vec![
                ("web1".to_string(), "ping data=hi".to_string()),
                ("web2".to_string(), "ping data=hi".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_host_failure_fails_process() {
        let process = Process::from_yaml(
            "name: deploy\ntasks:\n  - name: ping\n    action: ping\n    hosts: [web1, web2]\n  - name: after\n    action: ping\n    hosts: [web1]\n",
        )
        .unwrap();
        let recorder = Arc::new(Recorder {
            fail_on: Some("web2".to_string()),
            ..Default::default()
        });
        let err = play(&process, recorder.clone(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Process(ProcessError::Activity { .. })));
        assert!(err.to_string().contains("web2"));
        assert_eq!(recorder.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let process = Process::from_yaml("name: idle\ntasks:\n  - name: ping\n    action: ping\n    hosts: [web1]\n").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = play(&process, Arc::new(Recorder::default()), cancel).await.unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }
}
