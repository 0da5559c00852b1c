#[path = "../common/mod.rs"]
mod common;

use common::{answer_init, dispose_acknowledged, ready_channel, sample_image, ScriptedWorker};
use ocr_bridge::channel::{
    ChannelError, ChannelStatus, CommandChannel, CommandKind, InitOptions, LifecycleState,
    ProcessOptions,
};
use serde_json::json;

#[tokio::test]
async fn test_initialize_sends_init_and_caches_status() {
    let worker = ScriptedWorker::new();
    let channel = CommandChannel::new(worker.clone());
    assert_eq!(channel.state().await, LifecycleState::Uninitialized);

    let (status, init) = tokio::join!(
        channel.initialize(InitOptions::default().with_backend("webgpu")),
        answer_init(&worker)
    );

    let status = status.unwrap();
    assert!(status.initialized);
    assert_eq!(status.backend.as_deref(), Some("wasm"));
    assert!(!status.using_fallback);
    assert!(!status.models_loaded);

    assert_eq!(init.id, 1);
    assert_eq!(init.data["preferredBackend"], "webgpu");
    assert_eq!(channel.state().await, LifecycleState::Ready);
    assert_eq!(channel.cached_status().await, status);
}

#[tokio::test]
async fn test_concurrent_initialize_shares_one_bootstrap() {
    let worker = ScriptedWorker::new();
    let channel = CommandChannel::new(worker.clone());

    let (first, second, _) = tokio::join!(
        channel.initialize(InitOptions::default()),
        channel.initialize(InitOptions::default()),
        answer_init(&worker)
    );

    assert_eq!(first.unwrap(), second.unwrap());
    assert_eq!(worker.spawns(), 1);
    assert_eq!(worker.sent(), 1);
    assert!(worker.try_next_command().await.is_none());
}

#[tokio::test]
async fn test_concurrent_initialize_shares_failure() {
    let worker = ScriptedWorker::new();
    let channel = CommandChannel::new(worker.clone());

    let (first, second, _) = tokio::join!(
        channel.initialize(InitOptions::default()),
        channel.initialize(InitOptions::default()),
        async {
            let init = worker.next_command().await;
            worker.reply_error(init.id, "no backend available");
        }
    );

    let expected = ChannelError::command_failed(CommandKind::Init, "no backend available");
    assert_eq!(first.unwrap_err(), expected);
    assert_eq!(second.unwrap_err(), expected);
    assert_eq!(worker.spawns(), 1);
    assert_eq!(worker.terminations(), 1);
    assert_eq!(channel.state().await, LifecycleState::Uninitialized);
}

#[tokio::test]
async fn test_initialize_when_ready_is_a_no_op() {
    let (channel, worker) = ready_channel().await;

    let status = channel.initialize(InitOptions::default()).await.unwrap();

    assert!(status.initialized);
    assert_eq!(worker.spawns(), 1);
    assert!(worker.try_next_command().await.is_none());
}

#[tokio::test]
async fn test_commands_rejected_before_initialize() {
    let worker = ScriptedWorker::new();
    let channel = CommandChannel::new(worker.clone());

    let err = channel
        .process(sample_image(), ProcessOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err, ChannelError::NotInitialized);

    let err = channel.load_resources(None).await.unwrap_err();
    assert_eq!(err, ChannelError::NotInitialized);

    assert_eq!(worker.spawns(), 0);
    assert_eq!(worker.sent(), 0);
}

#[tokio::test]
async fn test_commands_rejected_while_initializing() {
    let worker = ScriptedWorker::new();
    let channel = CommandChannel::new(worker.clone());

    let (status, rejected) = tokio::join!(channel.initialize(InitOptions::default()), async {
        let init = worker.next_command().await;
        let rejected = channel.process(sample_image(), ProcessOptions::new()).await;
        worker.reply_success(init.id, common::init_report());
        rejected
    });

    assert!(status.is_ok());
    assert_eq!(rejected.unwrap_err(), ChannelError::NotInitialized);
    assert_eq!(worker.sent(), 1);
}

#[tokio::test]
async fn test_spawn_failure_allows_retry() {
    let worker = ScriptedWorker::new();
    let channel = CommandChannel::new(worker.clone());
    worker.fail_spawn(true);

    let err = channel.initialize(InitOptions::default()).await.unwrap_err();
    assert!(matches!(err, ChannelError::SpawnFailed(_)));
    assert_eq!(channel.state().await, LifecycleState::Uninitialized);

    worker.fail_spawn(false);
    let (status, _) = tokio::join!(channel.initialize(InitOptions::default()), answer_init(&worker));

    assert!(status.unwrap().initialized);
    assert_eq!(worker.spawns(), 2);
}

#[tokio::test]
async fn test_send_failure_fails_bootstrap() {
    let worker = ScriptedWorker::new();
    let channel = CommandChannel::new(worker.clone());
    worker.reject_sends(true);

    let err = channel.initialize(InitOptions::default()).await.unwrap_err();

    assert!(matches!(err, ChannelError::SendFailed(_)));
    assert_eq!(channel.state().await, LifecycleState::Uninitialized);
    assert_eq!(channel.pending_count().await, 0);
    assert_eq!(worker.terminations(), 1);
}

#[tokio::test]
async fn test_reinitialize_after_dispose() {
    let (channel, worker) = ready_channel().await;
    dispose_acknowledged(&channel, &worker).await;
    assert_eq!(channel.state().await, LifecycleState::Disposed);

    let (status, init) = tokio::join!(channel.initialize(InitOptions::default()), answer_init(&worker));

    assert!(status.unwrap().initialized);
    assert_eq!(channel.state().await, LifecycleState::Ready);
    assert_eq!(worker.spawns(), 2);
    // INIT (1), DISPOSE (2), INIT (3)
    assert_eq!(init.id, 3);
}

#[tokio::test]
async fn test_get_status_without_worker() {
    let worker = ScriptedWorker::new();
    let channel = CommandChannel::new(worker.clone());

    let status = channel.get_status().await;

    assert_eq!(status, ChannelStatus::default());
    assert!(!status.initialized);
    assert_eq!(worker.spawns(), 0);
}

#[tokio::test]
async fn test_get_status_round_trip() {
    let (channel, worker) = ready_channel().await;

    let (status, _) = tokio::join!(channel.get_status(), async {
        let command = worker.next_command().await;
        assert_eq!(command.kind, CommandKind::GetStatus);
        worker.reply_success(
            command.id,
            json!({
                "initialized": true,
                "backend": "wasm",
                "usingFallback": true,
                "modelsLoaded": true
            }),
        );
    });

    assert!(status.initialized);
    assert!(status.using_fallback);
    assert!(status.models_loaded);
    assert_eq!(status.error, None);
}

#[tokio::test]
async fn test_get_status_reports_failure_instead_of_erroring() {
    let (channel, worker) = ready_channel().await;

    let (status, _) = tokio::join!(channel.get_status(), async {
        let command = worker.next_command().await;
        worker.reply_error(command.id, "status unavailable");
    });

    assert!(!status.initialized);
    assert_eq!(
        status.error.as_deref(),
        Some("GET_STATUS failed: status unavailable")
    );
}

#[tokio::test]
async fn test_load_resources_marks_models_loaded() {
    let (channel, worker) = ready_channel().await;

    let (loaded, _) = tokio::join!(channel.load_resources(None), async {
        let command = worker.next_command().await;
        assert_eq!(command.kind, CommandKind::LoadModels);
        worker.reply_success(command.id, json!({ "models": ["det", "rec"] }));
    });

    assert_eq!(loaded.unwrap()["models"][1], "rec");
    assert!(channel.cached_status().await.models_loaded);
}
