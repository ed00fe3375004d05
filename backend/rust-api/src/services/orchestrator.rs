//! Per-session actor.
//!
//! One task owns the state store, dispatcher, reconciler, timers and
//! progression of a session and processes host requests, timer signals,
//! command outcomes, feed messages and resync results one at a time.
//! Views are published on a `watch` channel; live events also go out on a
//! `broadcast` channel for SSE consumers.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::metrics::{PHASE_TRANSITIONS_TOTAL, TRANSITIONS_REJECTED_TOTAL};
use crate::models::play_state::phase_label;
use crate::models::timer::{CountdownTick, LiveEvent, TimerFired, TimerKind};
use crate::models::{
    BlockProgressSummary, CommandEnvelope, FeedMessage, HostAction, InteractionKey,
    InteractionMode, InteractionOp, InteractionReport, RowUpdate, SessionMode, SessionView,
};
use crate::services::dispatcher::{CommandDispatcher, CommandOutcome, Settled};
use crate::services::interaction::{InteractionError, InteractionService};
use crate::services::play_machine::{legal_actions, plan, TransitionError, Trigger};
use crate::services::progression::{ProgressError, SessionProgress};
use crate::services::reconciler::{Reconciler, ResyncOutcome};
use crate::services::remote::{ChangeFeed, RemoteError, RemoteStore, SessionSource};
use crate::services::session_store::SessionStateStore;
use crate::services::timers::{PhaseTimers, TimerSignal};
use crate::utils::retry::retry_async_when;

const REQUEST_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Interaction(#[from] InteractionError),
    #[error(transparent)]
    Progress(#[from] ProgressError),
    #[error("session orchestrator is closed")]
    Closed,
}

/// Accepted host action: the optimistic view plus one confirmation per
/// dispatched command.
#[derive(Debug)]
pub struct Performed {
    pub view: SessionView,
    pub confirmations: Vec<oneshot::Receiver<Result<RowUpdate, RemoteError>>>,
}

impl Performed {
    /// Waits until every command of the action was confirmed or rolled back.
    pub async fn confirmed(self) -> Result<(), OrchestratorError> {
        for confirmation in self.confirmations {
            confirmation.await.map_err(|_| OrchestratorError::Closed)??;
        }
        Ok(())
    }
}

enum Request {
    Perform {
        action: HostAction,
        reply: oneshot::Sender<Result<Performed, OrchestratorError>>,
    },
    Report {
        report: InteractionReport,
        reply: oneshot::Sender<Result<BlockProgressSummary, OrchestratorError>>,
    },
    Shutdown,
}

/// Cheap, cloneable access to a running session actor.
#[derive(Clone)]
pub struct OrchestratorHandle {
    session_id: String,
    mode: SessionMode,
    requests: mpsc::Sender<Request>,
    views: watch::Receiver<SessionView>,
    events: broadcast::Sender<LiveEvent>,
}

impl OrchestratorHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn view(&self) -> SessionView {
        self.views.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionView> {
        self.views.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<LiveEvent> {
        self.events.subscribe()
    }

    /// Commands not yet confirmed; host consoles disable controls while
    /// this is non-zero.
    pub fn pending_commands(&self) -> usize {
        self.views.borrow().pending_commands
    }

    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }

    pub async fn perform(&self, action: HostAction) -> Result<Performed, OrchestratorError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request::Perform { action, reply })
            .await
            .map_err(|_| OrchestratorError::Closed)?;
        response.await.map_err(|_| OrchestratorError::Closed)?
    }

    pub async fn report(
        &self,
        report: InteractionReport,
    ) -> Result<BlockProgressSummary, OrchestratorError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request::Report { report, reply })
            .await
            .map_err(|_| OrchestratorError::Closed)?;
        response.await.map_err(|_| OrchestratorError::Closed)?
    }

    /// Runs a learner operation against a block of this session and feeds
    /// the resulting report into progression. Test sessions keep their
    /// interactions in memory only.
    pub async fn interact(
        &self,
        interactions: &InteractionService,
        block_id: &str,
        participant_id: &str,
        op: InteractionOp,
    ) -> Result<InteractionReport, OrchestratorError> {
        let block = self
            .view()
            .session
            .block(block_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound {
                table: "blocks",
                id: block_id.to_string(),
            })?;
        let mode = match self.mode {
            SessionMode::Live => InteractionMode::Play,
            SessionMode::Test => InteractionMode::Preview,
        };
        let key = InteractionKey::new(&self.session_id, block_id, participant_id);

        let report = interactions.apply(mode, &key, &block, op).await?;
        self.report(report.clone()).await?;
        Ok(report)
    }

    pub async fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown).await;
    }
}

/// Loads the session, subscribes to its feed and starts the actor.
pub async fn spawn(
    remote: Arc<dyn RemoteStore>,
    session_id: &str,
    mode: SessionMode,
    config: &Config,
) -> Result<(OrchestratorHandle, JoinHandle<()>), OrchestratorError> {
    let retry = config.feed_retry.retry_config();
    let session = retry_async_when(retry.clone(), RemoteError::is_retriable, || {
        remote.fetch_session(session_id, mode)
    })
    .await?;
    let feed = remote.subscribe(session_id, mode).await?;

    let (request_tx, request_rx) = mpsc::channel(REQUEST_BUFFER);
    let (timer_tx, timer_rx) = mpsc::unbounded_channel();
    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
    let (resync_tx, resync_rx) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(EVENT_BUFFER);

    let mut actor = Actor {
        session_id: session_id.to_string(),
        store: SessionStateStore::new(session),
        dispatcher: CommandDispatcher::new(remote.clone(), retry.clone(), outcome_tx),
        reconciler: Reconciler::new(remote.clone(), session_id, mode, retry, resync_tx),
        timers: PhaseTimers::new(config.timings.clone(), timer_tx),
        progress: SessionProgress::new(),
        countdown: None,
        last_error: None,
        views: None,
        events: events.clone(),
    };
    let initial = actor.build_view();
    let (view_tx, view_rx) = watch::channel(initial);
    actor.views = Some(view_tx);
    actor.refresh();

    tracing::info!("Orchestrator started for session {} ({})", session_id, mode.as_str());

    let channels = Channels {
        requests: request_rx,
        timers: timer_rx,
        outcomes: outcome_rx,
        feed,
        resyncs: resync_rx,
    };
    let task = tokio::spawn(actor.run(channels));

    let handle = OrchestratorHandle {
        session_id: session_id.to_string(),
        mode,
        requests: request_tx,
        views: view_rx,
        events,
    };
    Ok((handle, task))
}

struct Channels {
    requests: mpsc::Receiver<Request>,
    timers: mpsc::UnboundedReceiver<TimerSignal>,
    outcomes: mpsc::UnboundedReceiver<CommandOutcome>,
    feed: mpsc::Receiver<FeedMessage>,
    resyncs: mpsc::UnboundedReceiver<ResyncOutcome>,
}

struct Actor {
    session_id: String,
    store: SessionStateStore,
    dispatcher: CommandDispatcher,
    reconciler: Reconciler,
    timers: PhaseTimers,
    progress: SessionProgress,
    countdown: Option<u8>,
    last_error: Option<String>,
    views: Option<watch::Sender<SessionView>>,
    events: broadcast::Sender<LiveEvent>,
}

impl Actor {
    async fn run(mut self, mut channels: Channels) {
        let mut feed_open = true;

        loop {
            tokio::select! {
                request = channels.requests.recv() => match request {
                    Some(Request::Perform { action, reply }) => {
                        let _ = reply.send(self.perform(action));
                    }
                    Some(Request::Report { report, reply }) => {
                        let _ = reply.send(self.record_report(report));
                    }
                    Some(Request::Shutdown) | None => break,
                },
                Some(signal) = channels.timers.recv() => self.on_timer(signal),
                Some(outcome) = channels.outcomes.recv() => self.on_outcome(outcome),
                message = channels.feed.recv(), if feed_open => match message {
                    Some(message) => {
                        if self.reconciler.handle(&mut self.store, message) {
                            self.refresh();
                        }
                    }
                    None => {
                        feed_open = false;
                        self.reconciler.feed_closed();
                        self.refresh();
                    }
                },
                Some(resync) = channels.resyncs.recv() => self.on_resync(resync),
            }
        }

        self.teardown();
    }

    fn perform(&mut self, action: HostAction) -> Result<Performed, OrchestratorError> {
        let confirmations = self.apply(&Trigger::Host(action), true)?;
        Ok(Performed {
            view: self.build_view(),
            confirmations,
        })
    }

    /// Plans against the effective view and dispatches the plan's commands.
    fn apply(
        &mut self,
        trigger: &Trigger,
        confirm: bool,
    ) -> Result<Vec<oneshot::Receiver<Result<RowUpdate, RemoteError>>>, TransitionError> {
        let effective = self.store.view();
        let transition = match plan(&effective, trigger) {
            Ok(transition) => transition,
            Err(e) => {
                if let Trigger::Host(_) = trigger {
                    TRANSITIONS_REJECTED_TOTAL
                        .with_label_values(&[trigger.name()])
                        .inc();
                }
                tracing::warn!(
                    "Session {}: {} rejected: {}",
                    self.session_id,
                    trigger.name(),
                    e
                );
                return Err(e);
            }
        };

        if transition.changes_phase() {
            PHASE_TRANSITIONS_TOTAL
                .with_label_values(&[
                    phase_label(transition.from),
                    phase_label(transition.entered),
                    trigger.source(),
                ])
                .inc();
            tracing::info!(
                "Session {}: {} -> {} via {} ({})",
                self.session_id,
                phase_label(transition.from),
                phase_label(transition.entered),
                trigger.name(),
                trigger.source()
            );
        }

        let mut confirmations = Vec::new();
        for command in transition.commands {
            let envelope = CommandEnvelope::new(&self.session_id, effective.mode, command);
            let reply = if confirm {
                let (tx, rx) = oneshot::channel();
                confirmations.push(rx);
                Some(tx)
            } else {
                None
            };
            self.dispatcher.dispatch(&mut self.store, envelope, reply);
        }

        self.last_error = None;
        self.refresh();
        Ok(confirmations)
    }

    fn record_report(
        &mut self,
        report: InteractionReport,
    ) -> Result<BlockProgressSummary, OrchestratorError> {
        let summary = self.progress.record(self.store.authoritative(), report)?;
        self.refresh();
        Ok(summary)
    }

    fn on_timer(&mut self, signal: TimerSignal) {
        if !self.timers.is_current(&signal) {
            tracing::debug!(
                "Session {}: dropping stale timer signal {:?}",
                self.session_id,
                signal
            );
            return;
        }

        match signal {
            TimerSignal::Tick { remaining, .. } => {
                self.countdown = Some(remaining);
                let _ = self.events.send(LiveEvent::CountdownTick(CountdownTick {
                    session_id: self.session_id.clone(),
                    remaining,
                    timestamp: Utc::now(),
                }));
                self.publish();
            }
            TimerSignal::Fired {
                kind, armed_for, ..
            } => {
                self.timers.consume();
                let _ = self.events.send(LiveEvent::TimerFired(TimerFired {
                    session_id: self.session_id.clone(),
                    timer: kind,
                    armed_for,
                    timestamp: Utc::now(),
                }));
                if kind == TimerKind::Countdown {
                    self.countdown = None;
                }
                if self.apply(&Trigger::Timer(kind), false).is_err() {
                    self.refresh();
                }
            }
        }
    }

    fn on_outcome(&mut self, outcome: CommandOutcome) {
        match self.dispatcher.settle(&mut self.store, outcome) {
            Settled::Confirmed => self.refresh(),
            Settled::RolledBack { error, dropped } => {
                tracing::warn!(
                    "Session {}: rolled back {} optimistic change(s): {}",
                    self.session_id,
                    dropped,
                    error
                );
                self.last_error = Some(error.to_string());
                self.refresh();
            }
            Settled::Ignored => {}
        }
    }

    fn on_resync(&mut self, resync: ResyncOutcome) {
        match self.reconciler.apply_resync(&mut self.store, resync) {
            Ok(true) => self.refresh(),
            Ok(false) => {}
            Err(e) => {
                self.last_error = Some(format!("resync failed: {}", e));
                self.refresh();
            }
        }
    }

    /// Re-arms timers for the effective view and publishes it.
    fn refresh(&mut self) {
        let effective = self.store.view();
        self.timers.sync(&effective);
        if self.timers.armed() != Some(TimerKind::Countdown) {
            self.countdown = None;
        }
        self.publish();
    }

    fn publish(&self) {
        let view = self.build_view();
        if let Some(views) = &self.views {
            views.send_replace(view.clone());
        }
        let _ = self.events.send(LiveEvent::SessionView(Box::new(view)));
    }

    fn build_view(&self) -> SessionView {
        let session = self.store.view();
        SessionView {
            legal_actions: legal_actions(&session),
            progress: self.progress.current(&session),
            connected: self.reconciler.is_connected(),
            pending_commands: self.dispatcher.pending_count(),
            countdown: self.countdown,
            last_error: self.last_error.clone(),
            session,
        }
    }

    fn teardown(&mut self) {
        self.timers.cancel();
        self.dispatcher.shutdown();
        self.reconciler.shutdown();
        tracing::info!("Orchestrator stopped for session {}", self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PlayState, Session, SessionStatus};
    use crate::services::remote::MemoryRemoteStore;

    async fn start(remote: Arc<MemoryRemoteStore>) -> (OrchestratorHandle, JoinHandle<()>) {
        let session = Session::new(
            "s-1".to_string(),
            "ABC123".to_string(),
            SessionMode::Live,
            Vec::new(),
        );
        remote.create_session(&session).await.unwrap();
        spawn(remote, "s-1", SessionMode::Live, &Config::for_tests())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn host_actions_are_applied_optimistically_then_confirmed() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let (handle, _task) = start(remote.clone()).await;

        let performed = handle.perform(HostAction::StartSession).await.unwrap();
        assert_eq!(performed.view.session.status, SessionStatus::Active);
        assert_eq!(performed.view.session.phase, Some(PlayState::Lobby));
        assert_eq!(performed.confirmations.len(), 2);
        performed.confirmed().await.unwrap();

        let stored = remote.snapshot("s-1", SessionMode::Live).await.unwrap();
        assert_eq!(stored.phase, Some(PlayState::Lobby));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn illegal_actions_leave_the_view_unchanged() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let (handle, _task) = start(remote).await;
        let before = handle.view();

        let result = handle.perform(HostAction::ShowResults).await;
        assert!(matches!(result, Err(OrchestratorError::Transition(_))));
        assert_eq!(handle.view().session, before.session);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_the_handle() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let (handle, task) = start(remote).await;

        handle.shutdown().await;
        task.await.unwrap();
        assert!(handle.is_closed());
        assert!(matches!(
            handle.perform(HostAction::OpenLobby).await,
            Err(OrchestratorError::Closed)
        ));
    }

    #[tokio::test]
    async fn missing_sessions_fail_to_attach() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let result = spawn(remote, "nope", SessionMode::Live, &Config::for_tests()).await;
        assert!(matches!(
            result,
            Err(OrchestratorError::Remote(RemoteError::NotFound { .. }))
        ));
    }
}
