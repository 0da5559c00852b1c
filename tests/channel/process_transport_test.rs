//! End-to-end tests against a real child process speaking NDJSON.

#![cfg(unix)]

use ocr_bridge::channel::{
    ChannelError, CommandChannel, ImagePayload, InitOptions, LifecycleState, ProcessOptions,
    ProcessSpawner,
};

/// A worker that answers INIT (id 1), GET_STATUS (id 2) and DISPOSE (id 3)
/// in order, with some noise on stdout along the way.
const SCRIPTED_WORKER: &str = r#"
read line
echo 'not json'
echo '{"type":"SUCCESS","id":1,"data":{"backend":"wasm","usingFallback":true}}'
read line
echo '{"type":"LOG","data":{"level":"info","message":"status requested"}}'
echo '{"type":"SUCCESS","id":2,"data":{"initialized":true,"backend":"wasm","usingFallback":true,"modelsLoaded":false}}'
read line
echo '{"type":"SUCCESS","id":3,"data":null}'
"#;

/// A worker that acknowledges INIT and exits on the next command.
const EXITING_WORKER: &str = r#"
read line
echo '{"type":"SUCCESS","id":1,"data":null}'
read line
exit 3
"#;

fn sh(script: &str) -> ProcessSpawner {
    ProcessSpawner::new("sh").with_args(["-c", script])
}

#[tokio::test]
async fn test_round_trip_through_child_process() {
    let channel = CommandChannel::new(sh(SCRIPTED_WORKER));

    let status = channel.initialize(InitOptions::default()).await.unwrap();
    assert!(status.initialized);
    assert_eq!(status.backend.as_deref(), Some("wasm"));
    assert!(status.using_fallback);

    let status = channel.get_status().await;
    assert!(status.initialized);
    assert_eq!(status.error, None);

    channel.dispose().await;
    assert_eq!(channel.state().await, LifecycleState::Disposed);
}

#[tokio::test]
async fn test_worker_exit_fails_pending_command() {
    let channel = CommandChannel::new(sh(EXITING_WORKER));
    channel.initialize(InitOptions::default()).await.unwrap();

    let err = channel
        .process(
            ImagePayload::rgba(1, 1, vec![255, 255, 255, 255]),
            ProcessOptions::new(),
        )
        .await
        .unwrap_err();

    assert!(err.is_worker_fatal(), "unexpected error: {err}");
    channel.dispose().await;
}

#[tokio::test]
async fn test_missing_worker_binary() {
    let channel = CommandChannel::new(ProcessSpawner::new("/nonexistent/ocr-worker"));

    let err = channel.initialize(InitOptions::default()).await.unwrap_err();

    assert!(matches!(err, ChannelError::SpawnFailed(_)));
    assert_eq!(channel.state().await, LifecycleState::Uninitialized);
}
