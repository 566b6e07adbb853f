//! End-to-end tests: a real listener, real commands, reqwest clients.

use anyhow::Result;
use futures::StreamExt;
use smc::{router, AppState};
use smcconf::{CommandConfig, SmcConfig, WaitStrategy};
use std::time::Duration;
use tempfile::TempDir;

const PATH: &str = "/usr/bin:/bin";

/// Prints `tick1`..`tick5` with a pause between each line.
const TICKER: &str = "for i in 1 2 3 4 5; do echo tick$i; sleep 0.1; done";

struct TestServer {
    base: String,
    state: AppState,
    _temp_dir: TempDir,
}

async fn start(strategy: WaitStrategy) -> Result<TestServer> {
    let temp_dir = TempDir::new()?;

    let mut config = SmcConfig::default();
    config.infra.paths.state_dir = temp_dir.path().to_path_buf();
    config.infra.stream.segment_size = 16;
    config.infra.stream.wait_strategy = strategy;
    config.infra.stream.poll_interval_ms = 10;
    config.infra.stream.max_concurrent_commands = 4;
    config.commands = vec![
        CommandConfig::new("ticker", "/bin/sh")
            .with_arguments(["-c", TICKER])
            .with_env("PATH", PATH),
        CommandConfig::new("greet", "/bin/echo").with_arguments(["hello", "$1"]),
        CommandConfig::new("forever", "/bin/sh")
            .with_arguments(["-c", "echo started; sleep 30"])
            .with_env("PATH", PATH),
    ];
    config.validate()?;

    let state = AppState::from_config(&config)?;
    std::fs::create_dir_all(&state.streams_dir)?;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = router(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Ok(TestServer {
        base: format!("http://{}", addr),
        state,
        _temp_dir: temp_dir,
    })
}

async fn read_all(response: reqwest::Response) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    let mut chunks = response.bytes_stream();
    while let Some(chunk) = chunks.next().await {
        body.extend_from_slice(&chunk?);
    }
    Ok(body)
}

fn ticker_output() -> Vec<u8> {
    (1..=5).flat_map(|i| format!("tick{}\n", i).into_bytes()).collect()
}

async fn concurrent_readers_see_same_output(strategy: WaitStrategy) -> Result<()> {
    let server = start(strategy).await?;
    let client = reqwest::Client::new();
    let url = format!("{}/api/v1/ticker", server.base);

    let first = client.get(&url).send().await?;
    assert_eq!(first.headers()["stream-status"], "fresh");
    let id = first.headers()["x-id"].clone();

    // Join while the command is still ticking.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let second = client.get(&url).send().await?;
    assert_eq!(second.headers()["stream-status"], "refurbished");
    assert_eq!(second.headers()["x-id"], id);
    assert!(
        second.headers().get("content-length").is_none(),
        "open stream has no known length"
    );

    let (a, b) = tokio::join!(read_all(first), read_all(second));
    assert_eq!(a?, ticker_output());
    assert_eq!(b?, ticker_output());

    assert_eq!(server.state.registry.len(), 1, "one run for one argument list");
    Ok(())
}

#[tokio::test]
async fn test_push_readers_share_one_run() -> Result<()> {
    concurrent_readers_see_same_output(WaitStrategy::Push).await
}

#[tokio::test]
async fn test_poll_readers_share_one_run() -> Result<()> {
    concurrent_readers_see_same_output(WaitStrategy::Poll).await
}

#[tokio::test]
async fn test_late_reader_with_range() -> Result<()> {
    let server = start(WaitStrategy::Push).await?;
    let client = reqwest::Client::new();
    let url = format!("{}/api/v1/ticker", server.base);

    let full = read_all(client.get(&url).send().await?).await?;
    assert_eq!(full, ticker_output());

    let tail = client.get(&url).header("Range", "bytes=18-").send().await?;
    assert_eq!(tail.status(), reqwest::StatusCode::OK);
    assert_eq!(tail.headers()["content-length"], "12");
    assert!(tail.headers().contains_key("etag"));
    assert_eq!(read_all(tail).await?, b"tick4\ntick5\n");
    Ok(())
}

#[tokio::test]
async fn test_distinct_arguments_get_distinct_runs() -> Result<()> {
    let server = start(WaitStrategy::Push).await?;
    let client = reqwest::Client::new();

    let alice = client.get(format!("{}/api/v1/greet/alice", server.base)).send().await?;
    let bob = client.get(format!("{}/api/v1/greet/bob", server.base)).send().await?;
    assert_ne!(alice.headers()["x-id"], bob.headers()["x-id"]);
    assert_eq!(read_all(alice).await?, b"hello alice\n");
    assert_eq!(read_all(bob).await?, b"hello bob\n");

    assert_eq!(server.state.registry.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_delete_ends_running_command() -> Result<()> {
    let server = start(WaitStrategy::Push).await?;
    let client = reqwest::Client::new();
    let url = format!("{}/api/v1/forever", server.base);

    let response = client.get(&url).send().await?;
    let reader = tokio::spawn(read_all(response));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let deleted = client.delete(&url).send().await?;
    assert_eq!(deleted.status(), reqwest::StatusCode::OK);

    // The body ends once the killed command's stream closes.
    let body = tokio::time::timeout(Duration::from_secs(5), reader).await???;
    assert_eq!(body, b"started\n");
    Ok(())
}
