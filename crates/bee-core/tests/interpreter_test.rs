// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process execution through the interpreter.

mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use bee_core::interpreter::{Executor, play};
use bee_core::{Error, Result};
use bee_process::Process;
use common::RuntimeContext;

#[derive(Default)]
struct Journal {
    calls: Mutex<Vec<(String, String)>>,
    failing: Vec<&'static str>,
}

impl Journal {
    fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for Journal {
    async fn execute(&self, host: &str, shell: &str, _cancel: CancellationToken) -> Result<Vec<u8>> {
        self.calls
            .lock()
            .unwrap()
            .push((host.to_string(), shell.to_string()));
        if self.failing.iter().any(|action| shell.starts_with(action)) {
            return Err(Error::Exit {
                code: 1,
                stderr: format!("{} failed", shell),
            });
        }
        Ok(b"pong\n".to_vec())
    }
}

#[tokio::test]
async fn test_single_task_process() {
    let process = Process::from_yaml(
        r#"
name: smoke
tasks:
  - name: ping
    action: ping
    hosts: [host1]
"#,
    )
    .unwrap();
    let journal = Arc::new(Journal::default());

    play(&process, journal.clone(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(journal.calls(), vec![("host1".to_string(), "ping".to_string())]);
}

#[tokio::test]
async fn test_catch_and_notify_handlers() {
    let process = Process::from_yaml(
        r#"
name: deploy
hosts: [host1]
tasks:
  - name: upload
    action: copy
    args:
      src: ./app
      dest: /opt/app
    catch: rollback
  - name: configure
    action: ping
    args:
      data: configured
    notify: [restart]
handlers:
  - name: rollback
    action: ping
    args:
      data: rollback
  - name: restart
    action: ping
    args:
      data: restart
"#,
    )
    .unwrap();
    let journal = Arc::new(Journal {
        failing: vec!["copy"],
        ..Default::default()
    });

    play(&process, journal.clone(), CancellationToken::new())
        .await
        .unwrap();

    let shells: Vec<_> = journal.calls().into_iter().map(|(_, shell)| shell).collect();
    assert_eq!(
        shells,
        vec![
            "copy dest=/opt/app src=./app",
            "ping data=rollback",
            "ping data=configured",
            "ping data=restart",
        ]
    );
}

#[tokio::test]
async fn test_play_against_runtime() {
    let ctx = RuntimeContext::new().await;
    let process = Process::from_yaml(
        r#"
name: fleet
hosts: [host1, host2]
tasks:
  - name: ping
    action: ping
    args:
      data: fleet
"#,
    )
    .unwrap();

    play(&process, ctx.runtime.clone(), CancellationToken::new())
        .await
        .unwrap();

    for host in ["host1", "host2"] {
        let executes = ctx.connector.client(host).executes();
        assert!(executes.iter().any(|line| line.ends_with("--data=fleet")));
    }
}

#[tokio::test]
async fn test_unknown_host_fails_process() {
    let ctx = RuntimeContext::new().await;
    let process = Process::from_yaml(
        r#"
name: broken
tasks:
  - name: ping
    action: ping
    hosts: [ghost]
"#,
    )
    .unwrap();

    let err = play(&process, ctx.runtime.clone(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("ghost"));
}
