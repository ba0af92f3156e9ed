// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! gRPC transport tests against an in-process bee-agent.

mod common;

use tokio_util::sync::CancellationToken;

use bee_core::client::{Client, ExecOptions, GetOptions, GrpcClient, PutOptions};
use bee_core::Error;
use common::AgentContext;

async fn connect(agent: &AgentContext) -> GrpcClient {
    GrpcClient::connect(&agent.addr.to_string()).await.unwrap()
}

#[tokio::test]
async fn test_ping_reports_version() {
    let agent = AgentContext::start().await;
    let client = connect(&agent).await;
    assert_eq!(client.ping().await.unwrap(), env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_put_then_get_file() {
    let agent = AgentContext::start().await;
    let client = connect(&agent).await;
    let cancel = CancellationToken::new();
    let local = tempfile::tempdir().unwrap();

    let a = local.path().join("a");
    std::fs::write(&a, "hello world1").unwrap();
    let remote = agent.root.path().join("tmp/a").to_string_lossy().into_owned();
    let options = PutOptions {
        mkdir: true,
        ..Default::default()
    };
    client.put(&cancel, &a, &remote, options).await.unwrap();

    let stat = client.stat(&cancel, &remote).await.unwrap();
    assert!(!stat.is_dir);
    assert_eq!(stat.size, 12);

    let b = local.path().join("b");
    client.get(&cancel, &remote, &b, GetOptions::default()).await.unwrap();
    assert_eq!(std::fs::read_to_string(&b).unwrap(), "hello world1");
}

#[tokio::test]
async fn test_put_then_get_directory() {
    let agent = AgentContext::start().await;
    let client = connect(&agent).await;
    let cancel = CancellationToken::new();
    let local = tempfile::tempdir().unwrap();

    let tree = local.path().join("tree");
    std::fs::create_dir_all(tree.join("sub")).unwrap();
    std::fs::write(tree.join("top.txt"), "top").unwrap();
    std::fs::write(tree.join("sub/nested.txt"), vec![7u8; 100_000]).unwrap();

    let options = PutOptions {
        dir: true,
        mkdir: true,
        cache_size: 4096,
        ..Default::default()
    };
    client.put(&cancel, &tree, "modules/tree", options).await.unwrap();
    assert!(agent.root.path().join("modules/tree/sub/nested.txt").is_file());

    let copy = local.path().join("copy");
    let options = GetOptions {
        dir: true,
        ..Default::default()
    };
    client.get(&cancel, "modules/tree", &copy, options).await.unwrap();
    assert_eq!(std::fs::read_to_string(copy.join("top.txt")).unwrap(), "top");
    assert_eq!(std::fs::read(copy.join("sub/nested.txt")).unwrap(), vec![7u8; 100_000]);
}

#[tokio::test]
async fn test_put_without_mkdir_needs_parent() {
    let agent = AgentContext::start().await;
    let client = connect(&agent).await;
    let cancel = CancellationToken::new();
    let local = tempfile::tempdir().unwrap();
    let a = local.path().join("a");
    std::fs::write(&a, "x").unwrap();

    let err = client
        .put(&cancel, &a, "missing/dir/a", PutOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_not_exists());
}

#[tokio::test]
async fn test_stat_missing_maps_to_not_exists() {
    let agent = AgentContext::start().await;
    let client = connect(&agent).await;
    let err = client
        .stat(&CancellationToken::new(), "nothing-here")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotExists(_)));
}

#[cfg(unix)]
#[tokio::test]
async fn test_execute_captures_streams() {
    let agent = AgentContext::start().await;
    let client = connect(&agent).await;
    let cancel = CancellationToken::new();

    let mut cmd = client
        .execute(&cancel, "sh", ExecOptions::args(["-c", "echo out; echo err >&2"]))
        .await
        .unwrap();
    let output = cmd.output().await.unwrap();
    assert_eq!(output.stdout, b"out\n");
    assert_eq!(output.stderr, b"err\n");

    let mut cmd = client
        .execute(&cancel, "sh", ExecOptions::args(["-c", "echo nope >&2; exit 3"]))
        .await
        .unwrap();
    match cmd.output().await {
        Err(Error::Exit { code, stderr }) => {
            assert_eq!(code, 3);
            assert_eq!(stderr, "nope");
        }
        other => panic!("expected exit error, got {:?}", other.map(|o| o.stdout)),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_execute_pipes_stdin() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let agent = AgentContext::start().await;
    let client = connect(&agent).await;
    let cancel = CancellationToken::new();

    let mut cmd = client
        .execute(&cancel, "cat", ExecOptions::default())
        .await
        .unwrap();
    let mut stdin = cmd.stdin_pipe().unwrap();
    let mut stdout = cmd.stdout_pipe().unwrap();
    cmd.start().await.unwrap();

    stdin.write_all(b"through the agent").await.unwrap();
    stdin.shutdown().await.unwrap();
    drop(stdin);

    let mut received = Vec::new();
    stdout.read_to_end(&mut received).await.unwrap();
    cmd.wait().await.unwrap();
    assert_eq!(received, b"through the agent");
}
