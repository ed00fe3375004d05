use lessonplay_api::models::{
    AnswerValue, BlockStatus, ChatMode, HostAction, InteractionOp, PauseReason, PlayState,
    SessionMode, SessionPatch, SessionStatus,
};
use lessonplay_api::models::timer::{LiveEvent, TimerKind};
use lessonplay_api::services::interaction::{InteractionService, ScoringPolicy};
use lessonplay_api::services::interaction_store::MemoryInteractionStore;
use lessonplay_api::services::orchestrator::{OrchestratorError, OrchestratorHandle};
use lessonplay_api::services::remote::{MemoryRemoteStore, RemoteError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

mod common;

use common::{live_session, live_session_with, perform_confirmed, quiz_blocks, wait_for_view};

fn interactions() -> InteractionService {
    InteractionService::new(
        Arc::new(MemoryInteractionStore::default()),
        ScoringPolicy::default(),
    )
}

/// Lobby → countdown → intro → question_active on the first block.
async fn open_first_question(handle: &OrchestratorHandle) {
    perform_confirmed(handle, HostAction::Begin).await;
    wait_for_view(handle, |v| {
        v.session.phase == Some(PlayState::Intro) && v.pending_commands == 0
    })
    .await;
    let view = perform_confirmed(handle, HostAction::StartQuestion).await;
    assert_eq!(view.session.phase, Some(PlayState::QuestionActive));
    assert_eq!(view.session.current_block_id.as_deref(), Some("b-capital"));
}

#[tokio::test(start_paused = true)]
async fn countdown_ticks_then_enters_intro() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let (handle, _task) = live_session(remote.clone(), "s-countdown").await;
    let mut events = handle.events();

    let started = Instant::now();
    let view = perform_confirmed(&handle, HostAction::Begin).await;
    assert_eq!(view.session.phase, Some(PlayState::Countdown));

    let view = wait_for_view(&handle, |v| {
        v.session.phase == Some(PlayState::Intro) && v.pending_commands == 0
    })
    .await;
    assert!(started.elapsed() >= Duration::from_millis(3800));
    assert_eq!(view.countdown, None);
    assert!(view.allows("start_question"));

    let mut ticks = Vec::new();
    let mut fired = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            LiveEvent::CountdownTick(tick) => ticks.push(tick.remaining),
            LiveEvent::TimerFired(timer) => fired.push((timer.timer, timer.armed_for)),
            LiveEvent::SessionView(_) => {}
        }
    }
    assert_eq!(ticks, vec![3, 2, 1, 0]);
    assert_eq!(fired, vec![(TimerKind::Countdown, PlayState::Countdown)]);

    let stored = remote.snapshot("s-countdown", SessionMode::Live).await.unwrap();
    assert_eq!(stored.phase, Some(PlayState::Intro));
}

#[tokio::test(start_paused = true)]
async fn pause_for_technical_issue_then_resume_where_we_left() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let (handle, _task) = live_session(remote.clone(), "s-pause").await;
    open_first_question(&handle).await;

    let view = perform_confirmed(
        &handle,
        HostAction::PauseSession {
            reason: PauseReason::TechnicalIssue,
        },
    )
    .await;
    assert_eq!(view.session.status, SessionStatus::Paused);
    assert_eq!(view.session.phase, Some(PlayState::Paused));
    assert_eq!(view.session.resume_phase, Some(PlayState::QuestionActive));
    assert_eq!(view.session.pause_reason, Some(PauseReason::TechnicalIssue));
    assert!(view.allows("resume_session"));
    assert!(!view.allows("lock_question"));

    // A second pause is refused while suspended.
    let again = handle
        .perform(HostAction::PauseSession {
            reason: PauseReason::Break,
        })
        .await;
    assert!(matches!(again, Err(OrchestratorError::Transition(_))));

    let view = perform_confirmed(&handle, HostAction::ResumeSession).await;
    assert_eq!(view.session.status, SessionStatus::Active);
    assert_eq!(view.session.phase, Some(PlayState::QuestionActive));
    assert_eq!(view.session.current_block_id.as_deref(), Some("b-capital"));
    assert_eq!(view.session.resume_phase, None);
    assert_eq!(view.session.pause_reason, None);

    let stored = remote.snapshot("s-pause", SessionMode::Live).await.unwrap();
    assert_eq!(stored.status, SessionStatus::Active);
    assert_eq!(stored.phase, Some(PlayState::QuestionActive));
}

#[tokio::test(start_paused = true)]
async fn pausing_during_countdown_restarts_it_on_resume() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let (handle, _task) = live_session(remote.clone(), "s-pause-countdown").await;

    perform_confirmed(&handle, HostAction::Begin).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    perform_confirmed(
        &handle,
        HostAction::PauseSession {
            reason: PauseReason::Break,
        },
    )
    .await;

    // The countdown that was running must never fire.
    tokio::time::sleep(Duration::from_secs(10)).await;
    let view = handle.view();
    assert_eq!(view.session.phase, Some(PlayState::Paused));
    assert_eq!(view.countdown, None);

    let resumed_at = Instant::now();
    let view = perform_confirmed(&handle, HostAction::ResumeSession).await;
    assert_eq!(view.session.phase, Some(PlayState::Countdown));

    wait_for_view(&handle, |v| v.session.phase == Some(PlayState::Intro)).await;
    assert!(resumed_at.elapsed() >= Duration::from_millis(3800));
}

#[tokio::test(start_paused = true)]
async fn soft_lock_grace_locks_the_block() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let (handle, _task) = live_session(remote.clone(), "s-lock").await;
    open_first_question(&handle).await;

    let view = perform_confirmed(&handle, HostAction::LockQuestion).await;
    assert_eq!(view.session.phase, Some(PlayState::QuestionSoftLocked));

    let view = wait_for_view(&handle, |v| {
        v.session.phase == Some(PlayState::QuestionLocked) && v.pending_commands == 0
    })
    .await;
    let block = view.session.block("b-capital").unwrap();
    assert_eq!(block.status, BlockStatus::Locked);
    assert!(view.allows("show_results"));
}

#[tokio::test(start_paused = true)]
async fn results_auto_advance_to_leaderboard() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let mut blocks = quiz_blocks();
    blocks[0].settings.auto_advance = true;
    blocks[0].settings.auto_advance_delay_ms = Some(1500);
    let (handle, _task) = live_session_with(remote.clone(), "s-advance", blocks).await;
    open_first_question(&handle).await;
    let mut events = handle.events();

    perform_confirmed(&handle, HostAction::LockQuestion).await;
    perform_confirmed(&handle, HostAction::FinalizeLock).await;
    let shown_at = Instant::now();
    let view = perform_confirmed(&handle, HostAction::ShowResults).await;
    assert_eq!(view.session.phase, Some(PlayState::QuestionResults));

    let view = wait_for_view(&handle, |v| {
        v.session.phase == Some(PlayState::Leaderboard) && v.pending_commands == 0
    })
    .await;
    assert!(shown_at.elapsed() >= Duration::from_millis(1500));
    assert!(view.allows("next_block"));

    let mut fired = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let LiveEvent::TimerFired(timer) = event {
            fired.push((timer.timer, timer.armed_for));
        }
    }
    assert_eq!(fired, vec![(TimerKind::AutoAdvance, PlayState::QuestionResults)]);

    let stored = remote.snapshot("s-advance", SessionMode::Live).await.unwrap();
    assert_eq!(stored.phase, Some(PlayState::Leaderboard));
    assert_eq!(stored.current_block_id.as_deref(), Some("b-capital"));
    assert_eq!(stored.blocks[0].status, BlockStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn results_wait_for_the_host_without_auto_advance() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let (handle, _task) = live_session(remote.clone(), "s-manual").await;
    open_first_question(&handle).await;

    perform_confirmed(&handle, HostAction::LockQuestion).await;
    perform_confirmed(&handle, HostAction::FinalizeLock).await;
    perform_confirmed(&handle, HostAction::ShowResults).await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(handle.view().session.phase, Some(PlayState::QuestionResults));
    let stored = remote.snapshot("s-manual", SessionMode::Live).await.unwrap();
    assert_eq!(stored.phase, Some(PlayState::QuestionResults));
}

#[tokio::test(start_paused = true)]
async fn skipped_blocks_move_on_after_the_display_window() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let (handle, _task) = live_session(remote.clone(), "s-skip").await;
    open_first_question(&handle).await;

    let skipped_at = Instant::now();
    let view = perform_confirmed(&handle, HostAction::SkipBlock).await;
    assert_eq!(view.session.phase, Some(PlayState::BlockSkipped));
    assert_eq!(view.session.block("b-capital").unwrap().status, BlockStatus::Skipped);

    let view = wait_for_view(&handle, |v| {
        v.session.phase == Some(PlayState::QuestionActive) && v.pending_commands == 0
    })
    .await;
    assert!(skipped_at.elapsed() >= Duration::from_millis(2000));
    assert_eq!(view.session.current_block_id.as_deref(), Some("b-river"));

    let stored = remote.snapshot("s-skip", SessionMode::Live).await.unwrap();
    assert_eq!(stored.phase, Some(PlayState::QuestionActive));
    assert_eq!(stored.current_block_id.as_deref(), Some("b-river"));
    assert_eq!(stored.blocks[0].status, BlockStatus::Skipped);
    assert_eq!(stored.blocks[1].status, BlockStatus::Active);

    // Skipping the last block ends in final results.
    perform_confirmed(&handle, HostAction::SkipBlock).await;
    wait_for_view(&handle, |v| {
        v.session.phase == Some(PlayState::FinalResults) && v.pending_commands == 0
    })
    .await;
    let stored = remote.snapshot("s-skip", SessionMode::Live).await.unwrap();
    assert_eq!(stored.phase, Some(PlayState::FinalResults));
    assert_eq!(stored.blocks[1].status, BlockStatus::Skipped);
}

#[tokio::test(start_paused = true)]
async fn text_answers_score_with_attempt_penalty() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let (handle, _task) = live_session(remote, "s-paris").await;
    let service = interactions();
    open_first_question(&handle).await;

    let select = |text: &str| InteractionOp::Select {
        value: AnswerValue::Text(text.to_string()),
    };

    handle
        .interact(&service, "b-capital", "alice", select("paris"))
        .await
        .unwrap();
    let first = handle
        .interact(&service, "b-capital", "alice", InteractionOp::CheckAnswer)
        .await
        .unwrap();
    assert!(first.is_complete);
    assert_eq!(first.score, 100);
    assert_eq!(first.attempts, 1);

    handle
        .interact(&service, "b-capital", "bob", select("marseille"))
        .await
        .unwrap();
    let wrong = handle
        .interact(&service, "b-capital", "bob", InteractionOp::CheckAnswer)
        .await
        .unwrap();
    assert!(!wrong.is_complete);
    handle
        .interact(&service, "b-capital", "bob", InteractionOp::TryAgain)
        .await
        .unwrap();
    handle
        .interact(&service, "b-capital", "bob", select("  PARIS "))
        .await
        .unwrap();
    let second = handle
        .interact(&service, "b-capital", "bob", InteractionOp::CheckAnswer)
        .await
        .unwrap();
    assert!(second.is_complete);
    assert_eq!(second.score, 50);
    assert_eq!(second.attempts, 2);

    let progress = wait_for_view(&handle, |v| {
        v.progress.as_ref().is_some_and(|p| p.completed == 2)
    })
    .await
    .progress
    .unwrap();
    assert_eq!(progress.block_id, "b-capital");
    assert_eq!(progress.reported, 2);
    assert_eq!(progress.average_score, 75.0);

    // Completed interactions stay locked.
    let locked = handle
        .interact(&service, "b-capital", "alice", select("lyon"))
        .await;
    assert!(matches!(locked, Err(OrchestratorError::Interaction(_))));
}

#[tokio::test(start_paused = true)]
async fn rejected_write_rolls_back_the_optimistic_phase() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let (handle, _task) = live_session(remote.clone(), "s-rollback").await;

    remote
        .fail_next_write(RemoteError::Rejected("row locked by another host".to_string()))
        .await;
    let performed = handle.perform(HostAction::Begin).await.unwrap();
    assert_eq!(performed.view.session.phase, Some(PlayState::Countdown));
    assert_eq!(performed.view.pending_commands, 1);

    let result = performed.confirmed().await;
    assert!(matches!(
        result,
        Err(OrchestratorError::Remote(RemoteError::Rejected(_)))
    ));

    let view = wait_for_view(&handle, |v| v.pending_commands == 0).await;
    assert_eq!(view.session.phase, Some(PlayState::Lobby));
    assert_eq!(view.countdown, None);
    assert!(view
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("row locked")));

    // No countdown survives the rollback.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(handle.view().session.phase, Some(PlayState::Lobby));
    let stored = remote.snapshot("s-rollback", SessionMode::Live).await.unwrap();
    assert_eq!(stored.phase, Some(PlayState::Lobby));

    // The next accepted action clears the error.
    let view = perform_confirmed(&handle, HostAction::Begin).await;
    assert_eq!(view.last_error, None);
}

#[tokio::test(start_paused = true)]
async fn transport_failures_are_retried_until_confirmed() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let (handle, _task) = live_session(remote.clone(), "s-flaky").await;

    remote
        .fail_next_write(RemoteError::Transport("connection reset".to_string()))
        .await;
    let view = perform_confirmed(
        &handle,
        HostAction::SetChatMode {
            mode: ChatMode::Disabled,
        },
    )
    .await;
    assert_eq!(view.session.chat_mode, ChatMode::Disabled);

    let stored = remote.snapshot("s-flaky", SessionMode::Live).await.unwrap();
    assert_eq!(stored.chat_mode, ChatMode::Disabled);
    assert_eq!(handle.view().last_error, None);
}

#[tokio::test(start_paused = true)]
async fn reconnect_resyncs_changes_missed_while_offline() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let (handle, _task) = live_session(remote.clone(), "s-resync").await;
    wait_for_view(&handle, |v| v.connected).await;

    remote.disconnect_feed("s-resync", SessionMode::Live).await;
    wait_for_view(&handle, |v| !v.connected).await;

    let missed = SessionPatch {
        chat_mode: Some(ChatMode::Disabled),
        ..SessionPatch::default()
    };
    tokio_test::assert_ok!(
        remote
            .apply_external("s-resync", SessionMode::Live, missed)
            .await
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_ne!(handle.view().session.chat_mode, ChatMode::Disabled);

    remote.reconnect_feed("s-resync", SessionMode::Live).await;
    let view = wait_for_view(&handle, |v| {
        v.connected && v.session.chat_mode == ChatMode::Disabled
    })
    .await;
    let stored = remote.snapshot("s-resync", SessionMode::Live).await.unwrap();
    assert_eq!(view.session.version, stored.version);
}

#[tokio::test(start_paused = true)]
async fn external_changes_and_echoes_merge_once() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let (handle, _task) = live_session(remote.clone(), "s-echo").await;
    wait_for_view(&handle, |v| v.connected && v.pending_commands == 0).await;

    let patch = SessionPatch {
        chat_mode: Some(ChatMode::Disabled),
        ..SessionPatch::default()
    };
    remote
        .apply_external("s-echo", SessionMode::Live, patch)
        .await
        .unwrap();
    let view = wait_for_view(&handle, |v| v.session.chat_mode == ChatMode::Disabled).await;
    let version = view.session.version;

    // Our own writes come back through the feed; the view must not regress.
    let view = perform_confirmed(
        &handle,
        HostAction::SetChatMode {
            mode: ChatMode::Enabled,
        },
    )
    .await;
    assert_eq!(view.session.chat_mode, ChatMode::Enabled);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let view = handle.view();
    assert_eq!(view.session.chat_mode, ChatMode::Enabled);
    assert_eq!(view.session.version, version + 1);
    assert_eq!(view.pending_commands, 0);
}

#[tokio::test(start_paused = true)]
async fn no_timer_fires_after_shutdown() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let (handle, task) = live_session(remote.clone(), "s-teardown").await;

    perform_confirmed(&handle, HostAction::Begin).await;
    handle.shutdown().await;
    task.await.unwrap();
    assert!(handle.is_closed());

    tokio::time::sleep(Duration::from_secs(30)).await;
    let stored = remote.snapshot("s-teardown", SessionMode::Live).await.unwrap();
    assert_eq!(stored.phase, Some(PlayState::Countdown));
}
