use crate::models::{ChangeEvent, RowChange, Session};

/// Optimistic change not yet confirmed by the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub command_id: String,
    pub change: RowChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied,
    /// Older than the row already held; dropped.
    Stale,
    /// Row is not part of this session.
    Unknown,
}

/// Two-tier state of one session: the last confirmed row data plus an
/// ordered overlay of optimistic changes. The effective view is always
/// recomputed from both tiers through one merge function.
#[derive(Debug, Clone)]
pub struct SessionStateStore {
    authoritative: Session,
    pending: Vec<PendingChange>,
}

impl SessionStateStore {
    pub fn new(authoritative: Session) -> Self {
        Self {
            authoritative,
            pending: Vec::new(),
        }
    }

    pub fn authoritative(&self) -> &Session {
        &self.authoritative
    }

    /// Confirmed data with every pending change applied in order.
    pub fn view(&self) -> Session {
        let mut view = self.authoritative.clone();
        for pending in &self.pending {
            apply_change(&mut view, &pending.change);
        }
        view
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, command_id: &str) -> bool {
        self.pending.iter().any(|p| p.command_id == command_id)
    }

    pub fn apply_optimistic(&mut self, command_id: &str, change: RowChange) {
        self.pending.push(PendingChange {
            command_id: command_id.to_string(),
            change: strip_version(change),
        });
    }

    /// Merges the confirmed row update and retires the pending entry.
    pub fn confirm(&mut self, command_id: &str, update: &ChangeEvent) -> MergeOutcome {
        let outcome = self.merge_remote(update);
        self.pending.retain(|p| p.command_id != command_id);
        outcome
    }

    /// Drops the pending entry and every entry queued after it. Returns the
    /// ids dropped, in order.
    pub fn reject(&mut self, command_id: &str) -> Vec<String> {
        let Some(index) = self
            .pending
            .iter()
            .position(|p| p.command_id == command_id)
        else {
            return Vec::new();
        };
        self.pending
            .drain(index..)
            .map(|p| p.command_id)
            .collect()
    }

    /// Field-wise merge of a feed event into the confirmed tier. Events older
    /// than the row are ignored; equal versions re-apply idempotently.
    pub fn merge_remote(&mut self, event: &ChangeEvent) -> MergeOutcome {
        let change = match event.to_change() {
            Ok(change) => change,
            Err(e) => {
                tracing::warn!(
                    "Ignoring malformed change for {} {}: {}",
                    event.table.as_str(),
                    event.row_id,
                    e
                );
                return MergeOutcome::Unknown;
            }
        };

        match &change {
            RowChange::Session(patch) => {
                if event.row_id != self.authoritative.id {
                    return MergeOutcome::Unknown;
                }
                if let Some(version) = patch.version {
                    if version < self.authoritative.version {
                        return MergeOutcome::Stale;
                    }
                }
                self.authoritative.apply_patch(patch);
                MergeOutcome::Applied
            }
            RowChange::Block { block_id, patch } => {
                let Some(block) = self.authoritative.block(block_id) else {
                    return MergeOutcome::Unknown;
                };
                if let Some(version) = patch.version {
                    if version < block.version {
                        return MergeOutcome::Stale;
                    }
                }
                self.authoritative.apply_block_patch(block_id, patch);
                MergeOutcome::Applied
            }
        }
    }

    /// Replaces the confirmed tier with a fresh snapshot. Pending entries
    /// stay on top of it.
    pub fn replace_authoritative(&mut self, snapshot: Session) {
        self.authoritative = snapshot;
    }

    /// Row version a new write against this row should expect.
    pub fn row_version(&self, change: &RowChange) -> Option<u64> {
        match change {
            RowChange::Session(_) => Some(self.authoritative.version),
            RowChange::Block { block_id, .. } => {
                self.authoritative.block(block_id).map(|block| block.version)
            }
        }
    }
}

fn apply_change(session: &mut Session, change: &RowChange) {
    match change {
        RowChange::Session(patch) => session.apply_patch(patch),
        RowChange::Block { block_id, patch } => {
            session.apply_block_patch(block_id, patch);
        }
    }
}

fn strip_version(change: RowChange) -> RowChange {
    match change {
        RowChange::Session(patch) => RowChange::Session(patch.without_version()),
        RowChange::Block { block_id, mut patch } => {
            patch.version = None;
            RowChange::Block { block_id, patch }
        }
    }
}
