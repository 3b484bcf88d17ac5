//! Offline mutation queue with reconnect replay.
//!
//! While the link is down the client captures mutations as `QueuedOp`
//! values instead of sending them. The vocabulary is deliberately
//! closed: only operations whose replay is safe after an arbitrary gap
//! are queueable. Generic field patches and deletes are not, because
//! replaying them against state that moved on can silently destroy
//! other users' work.
//!
//! Coalescing: creates are append-only; every other op kind keeps at
//! most one queued entry per target. A newer op replaces the older one
//! in place, preserving the older op's queue position so replay order
//! stays close to intent order.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

use obra_core::{EntityDraft, Rgba};

use crate::protocol::{ClientFrame, EntityOp, LockOp, PresenceOp};
use crate::storage::journal::{JournalError, JournalRecord, QueueJournal};

/// A mutation captured while offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueuedOp {
    CreateEntity {
        project_id: Uuid,
        entity_id: Uuid,
        draft: EntityDraft,
        actor_id: Uuid,
    },
    UpdatePosition {
        project_id: Uuid,
        entity_id: Uuid,
        x: f32,
        y: f32,
        actor_id: Uuid,
        client_clock: u64,
    },
    AcquireLock {
        project_id: Uuid,
        entity_id: Uuid,
        user_id: Uuid,
        user_name: String,
    },
    ReleaseLock {
        project_id: Uuid,
        entity_id: Uuid,
    },
    SetPresence {
        project_id: Uuid,
        user_id: Uuid,
        name: String,
        color: Rgba,
    },
    UpdateCursor {
        project_id: Uuid,
        user_id: Uuid,
        x: f32,
        y: f32,
    },
    UpdateView {
        project_id: Uuid,
        user_id: Uuid,
        view: String,
    },
}

/// Coalescing classes. Ops with the same `(target, kind)` replace each
/// other; creates never coalesce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DedupKind {
    Position,
    Lock,
    Presence,
    Cursor,
    View,
}

impl QueuedOp {
    pub fn project_id(&self) -> Uuid {
        match self {
            QueuedOp::CreateEntity { project_id, .. }
            | QueuedOp::UpdatePosition { project_id, .. }
            | QueuedOp::AcquireLock { project_id, .. }
            | QueuedOp::ReleaseLock { project_id, .. }
            | QueuedOp::SetPresence { project_id, .. }
            | QueuedOp::UpdateCursor { project_id, .. }
            | QueuedOp::UpdateView { project_id, .. } => *project_id,
        }
    }

    /// Entity-or-user target plus coalescing class; `None` for creates.
    fn dedup_key(&self) -> Option<(Uuid, DedupKind)> {
        match self {
            QueuedOp::CreateEntity { .. } => None,
            QueuedOp::UpdatePosition { entity_id, .. } => Some((*entity_id, DedupKind::Position)),
            QueuedOp::AcquireLock { entity_id, .. } => Some((*entity_id, DedupKind::Lock)),
            QueuedOp::ReleaseLock { entity_id, .. } => Some((*entity_id, DedupKind::Lock)),
            QueuedOp::SetPresence { user_id, .. } => Some((*user_id, DedupKind::Presence)),
            QueuedOp::UpdateCursor { user_id, .. } => Some((*user_id, DedupKind::Cursor)),
            QueuedOp::UpdateView { user_id, .. } => Some((*user_id, DedupKind::View)),
        }
    }

    /// Build the wire frame that replays this op.
    pub fn to_frame(&self, seq: u64) -> ClientFrame {
        match self.clone() {
            QueuedOp::CreateEntity { entity_id, draft, actor_id, .. } => ClientFrame::Entity {
                seq,
                op: EntityOp::Create { entity_id, draft, actor_id },
            },
            QueuedOp::UpdatePosition { entity_id, x, y, actor_id, client_clock, .. } => {
                ClientFrame::Entity {
                    seq,
                    op: EntityOp::UpdatePosition { entity_id, x, y, actor_id, client_clock },
                }
            }
            QueuedOp::AcquireLock { entity_id, user_id, user_name, .. } => ClientFrame::Lock {
                seq,
                op: LockOp::Acquire { entity_id, user_id, user_name },
            },
            QueuedOp::ReleaseLock { entity_id, .. } => ClientFrame::Lock {
                seq,
                op: LockOp::Release { entity_id },
            },
            QueuedOp::SetPresence { user_id, name, color, .. } => ClientFrame::Presence {
                seq,
                op: PresenceOp::Set { user_id, name, color },
            },
            QueuedOp::UpdateCursor { user_id, x, y, .. } => ClientFrame::Presence {
                seq,
                op: PresenceOp::Cursor { user_id, x, y },
            },
            QueuedOp::UpdateView { user_id, view, .. } => ClientFrame::Presence {
                seq,
                op: PresenceOp::View { user_id, view },
            },
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            QueuedOp::CreateEntity { .. } => "create_entity",
            QueuedOp::UpdatePosition { .. } => "update_position",
            QueuedOp::AcquireLock { .. } => "acquire_lock",
            QueuedOp::ReleaseLock { .. } => "release_lock",
            QueuedOp::SetPresence { .. } => "set_presence",
            QueuedOp::UpdateCursor { .. } => "update_cursor",
            QueuedOp::UpdateView { .. } => "update_view",
        }
    }
}

/// FIFO queue of offline mutations with optional durable journaling.
///
/// Every mutation is journaled before it is applied in memory, so a
/// crash mid-session loses at most the op being written. Replay removal
/// from the middle of the queue (ops for other projects are retained)
/// marks the journal for compaction; `compact` rewrites it from live
/// state.
pub struct OfflineQueue {
    items: VecDeque<QueuedOp>,
    max_size: usize,
    journal: Option<QueueJournal>,
    needs_compact: bool,
}

/// Default queue capacity.
const DEFAULT_MAX_SIZE: usize = 10_000;

impl OfflineQueue {
    /// In-memory queue, nothing survives a restart.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_SIZE)
    }

    /// In-memory queue with an explicit capacity bound.
    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
            journal: None,
            needs_compact: false,
        }
    }

    /// Durable queue backed by a journal file. Previously journaled ops
    /// are replayed through the coalescing logic to rebuild the queue.
    pub fn with_journal(mut journal: QueueJournal) -> Self {
        let (records, corrupted) = journal.recover();
        let mut items = VecDeque::new();
        for record in records {
            Self::apply_record(&mut items, record);
        }
        if corrupted > 0 {
            log::warn!("Queue journal had {corrupted} corrupt record(s), skipped");
        }
        if !items.is_empty() {
            log::info!("Recovered {} queued ops from journal", items.len());
        }
        Self {
            items,
            max_size: DEFAULT_MAX_SIZE,
            journal: Some(journal),
            needs_compact: false,
        }
    }

    fn apply_record(items: &mut VecDeque<QueuedOp>, record: JournalRecord) {
        match record {
            JournalRecord::Push(op) => {
                Self::coalesce(items, op);
            }
            JournalRecord::Shift => {
                items.pop_front();
            }
            JournalRecord::Clear => items.clear(),
        }
    }

    /// Returns false when the op was appended fresh, true when it
    /// replaced an existing entry.
    fn coalesce(items: &mut VecDeque<QueuedOp>, op: QueuedOp) -> bool {
        if let Some(key) = op.dedup_key() {
            if let Some(existing) = items.iter_mut().find(|q| q.dedup_key() == Some(key)) {
                *existing = op;
                return true;
            }
        }
        items.push_back(op);
        false
    }

    /// Enqueue, coalescing against an earlier op for the same target.
    ///
    /// Returns false when the queue is full and the op was dropped
    /// (replacements always succeed, they add no entry).
    pub fn push(&mut self, op: QueuedOp) -> bool {
        let replaces = op
            .dedup_key()
            .map(|key| self.items.iter().any(|q| q.dedup_key() == Some(key)))
            .unwrap_or(false);
        if !replaces && self.items.len() >= self.max_size {
            return false;
        }
        self.journal_write(JournalRecord::Push(op.clone()));
        Self::coalesce(&mut self.items, op);
        true
    }

    /// Peek the op at the head of the queue.
    pub fn front(&self) -> Option<&QueuedOp> {
        self.items.front()
    }

    /// Remove the head op after it was acked (or rejected) by the server.
    pub fn shift(&mut self) -> Option<QueuedOp> {
        let op = self.items.pop_front();
        if op.is_some() {
            self.journal_write(JournalRecord::Shift);
        }
        op
    }

    /// Peek the first op belonging to `project_id`; ops for other
    /// projects are skipped, not removed.
    pub fn front_for(&self, project_id: Uuid) -> Option<&QueuedOp> {
        self.items.iter().find(|op| op.project_id() == project_id)
    }

    /// Remove the first op belonging to `project_id`.
    ///
    /// Head removal is journaled as `Shift`; mid-queue removal can't be
    /// expressed in the journal vocabulary and marks it for compaction.
    pub fn shift_for(&mut self, project_id: Uuid) -> Option<QueuedOp> {
        let idx = self.items.iter().position(|op| op.project_id() == project_id)?;
        let op = self.items.remove(idx);
        if op.is_some() {
            if idx == 0 {
                self.journal_write(JournalRecord::Shift);
            } else {
                self.needs_compact = true;
            }
        }
        op
    }

    /// Drop everything, including the journal contents.
    pub fn clear(&mut self) {
        if !self.items.is_empty() {
            self.journal_write(JournalRecord::Clear);
        }
        self.items.clear();
        self.needs_compact = false;
    }

    /// Rewrite the journal from live state.
    pub fn compact(&mut self) -> Result<(), JournalError> {
        if let Some(ref mut journal) = self.journal {
            let records: Vec<JournalRecord> =
                self.items.iter().cloned().map(JournalRecord::Push).collect();
            journal.compact(&records)?;
        }
        self.needs_compact = false;
        Ok(())
    }

    pub fn needs_compact(&self) -> bool {
        self.needs_compact
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedOp> {
        self.items.iter()
    }

    fn journal_write(&mut self, record: JournalRecord) {
        if let Some(ref mut journal) = self.journal {
            if let Err(e) = journal.append(&record) {
                log::error!("Failed to journal queued op: {e}");
            }
        }
    }
}

impl Default for OfflineQueue {
    fn default() -> Self {
        Self::new()
    }
}
