#[path = "../common/mod.rs"]
mod common;

use common::{dispose_acknowledged, ready_channel, sample_image, ScriptedWorker};
use ocr_bridge::channel::{
    listener, ChannelError, ChannelStatus, CommandChannel, CommandKind, EventKind, InitOptions,
    LifecycleState, ProcessOptions,
};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn test_dispose_rejects_pending_commands() {
    let (channel, worker) = ready_channel().await;

    let (first, second, third, _) = tokio::join!(
        channel.process(sample_image(), ProcessOptions::new()),
        channel.process(sample_image(), ProcessOptions::new()),
        channel.load_resources(None),
        async {
            for _ in 0..3 {
                worker.next_command().await;
            }
            dispose_acknowledged(&channel, &worker).await;
        }
    );

    assert_eq!(first.unwrap_err(), ChannelError::Disposed);
    assert_eq!(second.unwrap_err(), ChannelError::Disposed);
    assert_eq!(third.unwrap_err(), ChannelError::Disposed);
    assert_eq!(channel.pending_count().await, 0);
    assert_eq!(channel.state().await, LifecycleState::Disposed);
    assert_eq!(worker.terminations(), 1);
}

#[tokio::test]
async fn test_dispose_clears_subscriptions_and_status() {
    let (channel, worker) = ready_channel().await;
    channel.on(EventKind::Progress, listener(|_| {}));
    channel.on(EventKind::Log, listener(|_| {}));
    channel.on(EventKind::Error, listener(|_| {}));

    dispose_acknowledged(&channel, &worker).await;

    assert_eq!(channel.listener_count(EventKind::Progress), 0);
    assert_eq!(channel.listener_count(EventKind::Log), 0);
    assert_eq!(channel.listener_count(EventKind::Error), 0);
    assert_eq!(channel.cached_status().await, ChannelStatus::default());
    assert_eq!(channel.get_status().await, ChannelStatus::default());
}

#[tokio::test]
async fn test_commands_after_dispose_are_rejected() {
    let (channel, worker) = ready_channel().await;
    dispose_acknowledged(&channel, &worker).await;
    let sent = worker.sent();

    let err = channel
        .process(sample_image(), ProcessOptions::new())
        .await
        .unwrap_err();

    assert_eq!(err, ChannelError::Disposed);
    assert_eq!(worker.sent(), sent);
}

#[tokio::test]
async fn test_dispose_is_idempotent() {
    let (channel, worker) = ready_channel().await;

    dispose_acknowledged(&channel, &worker).await;
    channel.dispose().await;

    assert_eq!(channel.state().await, LifecycleState::Disposed);
    assert_eq!(worker.terminations(), 1);
    assert!(worker.try_next_command().await.is_none());
}

#[tokio::test]
async fn test_concurrent_dispose_tears_down_once() {
    let (channel, worker) = ready_channel().await;

    tokio::join!(channel.dispose(), channel.dispose(), async {
        let command = worker.next_command().await;
        assert_eq!(command.kind, CommandKind::Dispose);
        worker.reply_success(command.id, json!(null));
    });

    assert_eq!(worker.terminations(), 1);
    // INIT + one DISPOSE
    assert_eq!(worker.sent(), 2);
}

#[tokio::test]
async fn test_dispose_without_initialize() {
    let worker = ScriptedWorker::new();
    let channel = CommandChannel::new(worker.clone());

    channel.dispose().await;

    assert_eq!(channel.state().await, LifecycleState::Disposed);
    assert_eq!(worker.spawns(), 0);
    assert_eq!(worker.terminations(), 0);
}

#[tokio::test]
async fn test_dispose_during_initialize() {
    let worker = ScriptedWorker::new();
    let channel = CommandChannel::new(worker.clone());

    let (status, init) = tokio::join!(channel.initialize(InitOptions::default()), async {
        let init = worker.next_command().await;
        channel.dispose().await;
        init
    });

    assert_eq!(status.unwrap_err(), ChannelError::Disposed);
    assert_eq!(channel.state().await, LifecycleState::Disposed);
    assert_eq!(worker.terminations(), 1);

    // The INIT answer arrives after teardown and goes nowhere.
    assert!(!worker.reply_success(init.id, common::init_report()));
    assert_eq!(channel.state().await, LifecycleState::Disposed);
    // No DISPOSE was sent to a worker that never became ready.
    assert!(worker.try_next_command().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_dispose_still_tears_down() {
    let (channel, worker) = ready_channel().await;

    channel.dispose().await;

    assert_eq!(channel.state().await, LifecycleState::Disposed);
    assert_eq!(worker.terminations(), 1);
    assert_eq!(channel.pending_count().await, 0);

    let dispose = worker.try_next_command().await.unwrap();
    assert_eq!(dispose.kind, CommandKind::Dispose);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_dispose_still_completes() {
    let (channel, worker) = ready_channel().await;

    let dropped = tokio::time::timeout(Duration::from_millis(10), channel.dispose()).await;
    assert!(dropped.is_err());
    assert_eq!(channel.state().await, LifecycleState::Disposing);

    let dispose = worker.next_command().await;
    assert_eq!(dispose.kind, CommandKind::Dispose);
    worker.reply_success(dispose.id, json!(null));

    // Joins the teardown that kept running in the background.
    channel.dispose().await;
    assert_eq!(channel.state().await, LifecycleState::Disposed);
    assert_eq!(worker.terminations(), 1);

    let (status, _) = tokio::join!(
        channel.initialize(InitOptions::default()),
        common::answer_init(&worker)
    );
    assert!(status.unwrap().initialized);
}

#[tokio::test]
async fn test_cancelled_command_leaves_the_table() {
    let (channel, worker) = ready_channel().await;

    {
        let call = channel.process(sample_image(), ProcessOptions::new());
        tokio::pin!(call);
        tokio::select! {
            _ = &mut call => panic!("command settled without a reply"),
            command = worker.next_command() => assert_eq!(command.kind, CommandKind::ProcessImage),
        }
        assert_eq!(channel.pending_count().await, 1);
    }
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert_eq!(channel.pending_count().await, 0);
}
