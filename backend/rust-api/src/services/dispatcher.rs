use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::metrics::{record_command, ROLLBACKS_TOTAL};
use crate::models::{CommandEnvelope, RowChange, RowUpdate};
use crate::services::remote::{CommandSink, RemoteError, RemoteStore};
use crate::services::session_store::SessionStateStore;
use crate::utils::retry::{retry_async_when, RetryConfig};

/// Per-command confirmation channel handed back to whoever issued it.
pub type Confirmation = oneshot::Sender<Result<RowUpdate, RemoteError>>;

/// Result of one remote write, reported back to the owning actor.
#[derive(Debug)]
pub struct CommandOutcome {
    pub command_id: String,
    pub result: Result<RowUpdate, RemoteError>,
}

#[derive(Debug, PartialEq)]
pub enum Settled {
    Confirmed,
    /// The command failed; it and `dropped - 1` later commands were rolled back.
    RolledBack { error: RemoteError, dropped: usize },
    /// Outcome for a command this dispatcher no longer tracks.
    Ignored,
}

struct Queued {
    envelope: CommandEnvelope,
    reply: Option<Confirmation>,
}

struct InFlight {
    queued: Queued,
    task: JoinHandle<()>,
}

/// Serialises a session's remote writes. Each command is applied to the
/// optimistic tier at dispatch and sent once everything before it settled.
pub struct CommandDispatcher {
    sink: Arc<dyn RemoteStore>,
    retry: RetryConfig,
    queue: VecDeque<Queued>,
    in_flight: Option<InFlight>,
    outcomes: mpsc::UnboundedSender<CommandOutcome>,
}

impl CommandDispatcher {
    pub fn new(
        sink: Arc<dyn RemoteStore>,
        retry: RetryConfig,
        outcomes: mpsc::UnboundedSender<CommandOutcome>,
    ) -> Self {
        Self {
            sink,
            retry,
            queue: VecDeque::new(),
            in_flight: None,
            outcomes,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len() + usize::from(self.in_flight.is_some())
    }

    pub fn dispatch(
        &mut self,
        store: &mut SessionStateStore,
        envelope: CommandEnvelope,
        reply: Option<Confirmation>,
    ) {
        tracing::debug!(
            "Dispatching {} {} for session {}",
            envelope.command.label(),
            envelope.command_id,
            envelope.session_id
        );
        let mut envelope = envelope;
        let change = envelope.command.patch();
        envelope.expected_version = self.planned_version(store, &change);
        store.apply_optimistic(&envelope.command_id, change);
        self.queue.push_back(Queued { envelope, reply });
        self.pump();
    }

    /// Row version a command expects, fixed when it is planned: one past the
    /// latest earlier command on the same row, or the confirmed row version.
    /// A foreign write landing while it waits makes it stale.
    fn planned_version(&self, store: &SessionStateStore, change: &RowChange) -> Option<u64> {
        let earlier = self
            .queue
            .iter()
            .rev()
            .chain(self.in_flight.as_ref().map(|f| &f.queued))
            .find(|queued| same_row(&queued.envelope.command.patch(), change));
        match earlier {
            Some(queued) => queued.envelope.expected_version.map(|v| v + 1),
            None => store.row_version(change),
        }
    }

    fn pump(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        let Some(queued) = self.queue.pop_front() else {
            return;
        };

        let sink = self.sink.clone();
        let retry = self.retry.clone();
        let outcomes = self.outcomes.clone();
        let envelope = queued.envelope.clone();
        let task = tokio::spawn(async move {
            let result =
                retry_async_when(retry, RemoteError::is_retriable, || sink.execute(&envelope))
                    .await;
            let _ = outcomes.send(CommandOutcome {
                command_id: envelope.command_id.clone(),
                result,
            });
        });

        self.in_flight = Some(InFlight { queued, task });
    }

    /// Applies the outcome of the in-flight command and sends the next one.
    pub fn settle(&mut self, store: &mut SessionStateStore, outcome: CommandOutcome) -> Settled {
        let matches = self
            .in_flight
            .as_ref()
            .is_some_and(|f| f.queued.envelope.command_id == outcome.command_id);
        if !matches {
            tracing::debug!("Ignoring outcome for untracked command {}", outcome.command_id);
            return Settled::Ignored;
        }
        let Some(InFlight { queued, .. }) = self.in_flight.take() else {
            return Settled::Ignored;
        };
        let label = queued.envelope.command.label();

        let settled = match outcome.result {
            Ok(update) => {
                store.confirm(&outcome.command_id, &update);
                record_command(label, "confirmed");
                if let Some(reply) = queued.reply {
                    let _ = reply.send(Ok(update));
                }
                Settled::Confirmed
            }
            Err(error) => {
                tracing::warn!(
                    "Command {} ({}) for session {} failed: {}",
                    outcome.command_id,
                    label,
                    queued.envelope.session_id,
                    error
                );
                record_command(label, error.label());
                let dropped = store.reject(&outcome.command_id).len();
                ROLLBACKS_TOTAL.inc();

                if let Some(reply) = queued.reply {
                    let _ = reply.send(Err(error.clone()));
                }
                // Later commands were planned on top of the failed one.
                for later in self.queue.drain(..) {
                    record_command(later.envelope.command.label(), "cascaded");
                    if let Some(reply) = later.reply {
                        let _ = reply.send(Err(error.clone()));
                    }
                }
                Settled::RolledBack { error, dropped }
            }
        };

        self.pump();
        settled
    }

    /// Aborts the in-flight write and drops everything queued.
    pub fn shutdown(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.task.abort();
        }
        self.queue.clear();
    }
}

fn same_row(a: &RowChange, b: &RowChange) -> bool {
    match (a, b) {
        (RowChange::Session(_), RowChange::Session(_)) => true,
        (RowChange::Block { block_id: a, .. }, RowChange::Block { block_id: b, .. }) => a == b,
        _ => false,
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Block, BlockSettings, BlockStatus, ChatMode, Command, PlayState, Session, SessionMode,
        SessionPatch, SessionStatus,
    };
    use crate::services::remote::{MemoryRemoteStore, SessionSource};
    use std::time::Duration;

    fn retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            jitter_max: None,
        }
    }

    async fn seeded(remote: &MemoryRemoteStore) -> Session {
        let session = Session::new(
            "s-1".to_string(),
            "ABC123".to_string(),
            SessionMode::Live,
            Vec::new(),
        );
        remote.create_session(&session).await.unwrap();
        remote.fetch_session("s-1", SessionMode::Live).await.unwrap()
    }

    fn envelope(command: Command) -> CommandEnvelope {
        CommandEnvelope::new("s-1", SessionMode::Live, command)
    }

    fn start() -> Vec<Command> {
        vec![
            Command::UpdateSessionStatus {
                status: SessionStatus::Active,
                pause_reason: None,
            },
            Command::UpdatePlayState {
                play_state: PlayState::Lobby,
                current_block_id: None,
                resume_phase: None,
            },
        ]
    }

    #[tokio::test]
    async fn commands_confirm_in_order() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let session = seeded(&remote).await;
        let mut store = SessionStateStore::new(session);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = CommandDispatcher::new(remote.clone(), retry(), tx);

        let (reply, confirmed) = oneshot::channel();
        let mut commands = start().into_iter();
        dispatcher.dispatch(&mut store, envelope(commands.next().unwrap()), None);
        dispatcher.dispatch(&mut store, envelope(commands.next().unwrap()), Some(reply));
        assert_eq!(dispatcher.pending_count(), 2);
        assert_eq!(store.view().phase, Some(PlayState::Lobby));

        while dispatcher.pending_count() > 0 {
            let outcome = rx.recv().await.unwrap();
            assert_eq!(dispatcher.settle(&mut store, outcome), Settled::Confirmed);
        }

        assert!(confirmed.await.unwrap().is_ok());
        assert_eq!(store.pending_count(), 0);
        assert_eq!(store.authoritative().status, SessionStatus::Active);
        assert_eq!(store.authoritative().phase, Some(PlayState::Lobby));
        assert_eq!(store.authoritative().version, 2);
    }

    #[tokio::test]
    async fn rejection_rolls_back_the_whole_tail() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let session = seeded(&remote).await;
        let mut store = SessionStateStore::new(session);
        let before = store.view();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = CommandDispatcher::new(remote.clone(), retry(), tx);

        remote
            .fail_next_write(RemoteError::Rejected("row locked".to_string()))
            .await;
        let (first_reply, first) = oneshot::channel();
        let (second_reply, second) = oneshot::channel();
        let mut commands = start().into_iter();
        dispatcher.dispatch(&mut store, envelope(commands.next().unwrap()), Some(first_reply));
        dispatcher.dispatch(&mut store, envelope(commands.next().unwrap()), Some(second_reply));

        let outcome = rx.recv().await.unwrap();
        let settled = dispatcher.settle(&mut store, outcome);
        assert_eq!(
            settled,
            Settled::RolledBack {
                error: RemoteError::Rejected("row locked".to_string()),
                dropped: 2
            }
        );
        assert_eq!(dispatcher.pending_count(), 0);
        assert_eq!(store.view(), before);
        assert!(first.await.unwrap().is_err());
        assert!(second.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn transport_failures_are_retried_with_the_same_id() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let session = seeded(&remote).await;
        let mut store = SessionStateStore::new(session);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = CommandDispatcher::new(remote.clone(), retry(), tx);

        remote
            .fail_next_write(RemoteError::Transport("connection reset".to_string()))
            .await;
        dispatcher.dispatch(
            &mut store,
            envelope(Command::UpdateSessionStatus {
                status: SessionStatus::Waiting,
                pause_reason: None,
            }),
            None,
        );

        let outcome = rx.recv().await.unwrap();
        assert_eq!(dispatcher.settle(&mut store, outcome), Settled::Confirmed);
        assert_eq!(store.authoritative().status, SessionStatus::Waiting);
        assert_eq!(store.authoritative().version, 1);
    }

    #[tokio::test]
    async fn stale_outcomes_are_ignored() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let session = seeded(&remote).await;
        let mut store = SessionStateStore::new(session);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut dispatcher = CommandDispatcher::new(remote, retry(), tx);

        let outcome = CommandOutcome {
            command_id: "unknown".to_string(),
            result: Err(RemoteError::Transport("late".to_string())),
        };
        assert_eq!(dispatcher.settle(&mut store, outcome), Settled::Ignored);
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test]
    async fn queued_command_goes_stale_when_the_row_moves_under_it() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let session = Session::new(
            "s-1".to_string(),
            "ABC123".to_string(),
            SessionMode::Live,
            vec![Block {
                id: "b-0".to_string(),
                position: 0,
                plugin: "true_false".to_string(),
                content: serde_json::json!({"correct": true}),
                settings: BlockSettings::default(),
                status: BlockStatus::Pending,
                version: 0,
            }],
        );
        remote.create_session(&session).await.unwrap();
        let session = remote.fetch_session("s-1", SessionMode::Live).await.unwrap();
        let mut store = SessionStateStore::new(session);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = CommandDispatcher::new(remote.clone(), retry(), tx);

        remote.hold_writes();
        dispatcher.dispatch(
            &mut store,
            envelope(Command::UpdateBlockStatus {
                block_id: "b-0".to_string(),
                status: BlockStatus::Active,
            }),
            None,
        );
        let (status_reply, status) = oneshot::channel();
        let (phase_reply, phase) = oneshot::channel();
        let mut commands = start().into_iter();
        dispatcher.dispatch(&mut store, envelope(commands.next().unwrap()), Some(status_reply));
        dispatcher.dispatch(&mut store, envelope(commands.next().unwrap()), Some(phase_reply));

        // Another console writes the session row while both are queued.
        let external = remote
            .apply_external(
                "s-1",
                SessionMode::Live,
                SessionPatch {
                    chat_mode: Some(ChatMode::Disabled),
                    ..SessionPatch::default()
                },
            )
            .await
            .unwrap();
        store.merge_remote(&external);
        remote.release_writes();

        let outcome = rx.recv().await.unwrap();
        assert_eq!(dispatcher.settle(&mut store, outcome), Settled::Confirmed);

        let outcome = rx.recv().await.unwrap();
        assert_eq!(
            dispatcher.settle(&mut store, outcome),
            Settled::RolledBack {
                error: RemoteError::Stale {
                    expected: 0,
                    actual: 1
                },
                dropped: 2
            }
        );
        assert!(matches!(
            status.await.unwrap(),
            Err(RemoteError::Stale { .. })
        ));
        assert!(phase.await.unwrap().is_err());
        assert_eq!(dispatcher.pending_count(), 0);

        let stored = remote.snapshot("s-1", SessionMode::Live).await.unwrap();
        assert_eq!(stored.status, SessionStatus::Draft);
        assert_eq!(stored.chat_mode, ChatMode::Disabled);
        assert_eq!(stored.blocks[0].status, BlockStatus::Active);
    }

    #[test]
    fn later_commands_on_a_row_expect_the_versions_before_them() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let mut session = Session::new(
            "s-1".to_string(),
            "ABC123".to_string(),
            SessionMode::Live,
            Vec::new(),
        );
        session.version = 4;
        let store = SessionStateStore::new(session);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut dispatcher = CommandDispatcher::new(remote, retry(), tx);

        for command in start() {
            let planned = dispatcher.planned_version(&store, &command.patch());
            dispatcher.queue.push_back(Queued {
                envelope: CommandEnvelope {
                    expected_version: planned,
                    ..envelope(command)
                },
                reply: None,
            });
        }

        let expected: Vec<_> = dispatcher
            .queue
            .iter()
            .map(|q| q.envelope.expected_version)
            .collect();
        assert_eq!(expected, vec![Some(4), Some(5)]);
    }
}
