use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::Command;

/// A recorded local command with the command that reverts it
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub command: Command,
    pub inverse: Command,
    recorded_at: Instant,
}

impl HistoryEntry {
    pub fn new(command: Command, inverse: Command) -> Self {
        Self::at(command, inverse, Instant::now())
    }

    pub fn at(command: Command, inverse: Command, recorded_at: Instant) -> Self {
        Self {
            command,
            inverse,
            recorded_at,
        }
    }
}

/// One undo step: the entries recorded between two commits, in apply order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    entries: Vec<HistoryEntry>,
}

impl Transaction {
    pub fn new(entries: Vec<HistoryEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<HistoryEntry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-session undo/redo log.
///
/// Holds only this session's edits. The log never touches a document; the
/// session applies inverses and hands the resulting transactions back.
#[derive(Debug)]
pub struct UndoRedoLog {
    capacity: usize,
    merge_window: Duration,
    undo_stack: VecDeque<Transaction>,
    redo_stack: Vec<Transaction>,
    open: Option<Transaction>,
}

impl UndoRedoLog {
    pub fn new(capacity: usize, merge_window: Duration) -> Self {
        Self {
            capacity,
            merge_window,
            undo_stack: VecDeque::new(),
            redo_stack: Vec::new(),
            open: None,
        }
    }

    pub fn record(&mut self, command: Command, inverse: Command) {
        self.record_at(command, inverse, Instant::now());
    }

    /// Record a new local edit. Clears redo.
    ///
    /// Joins the open transaction while edits keep arriving within the merge
    /// window, and coalesces with the previous entry when both the commands
    /// and their inverses merge.
    pub fn record_at(&mut self, command: Command, inverse: Command, now: Instant) {
        self.redo_stack.clear();

        let expired = self
            .open
            .as_ref()
            .and_then(|t| t.entries.last())
            .map_or(false, |last| {
                now.saturating_duration_since(last.recorded_at) > self.merge_window
            });
        if expired {
            self.commit();
        }

        let transaction = self.open.get_or_insert_with(Transaction::default);
        if let Some(last) = transaction.entries.last_mut() {
            let merged = last
                .command
                .merge(&command)
                .zip(inverse.merge(&last.inverse));
            if let Some((merged_command, merged_inverse)) = merged {
                last.command = merged_command;
                last.inverse = merged_inverse;
                last.recorded_at = now;
                return;
            }
        }
        transaction.entries.push(HistoryEntry::at(command, inverse, now));
    }

    /// Close the open transaction into one undo step.
    pub fn commit(&mut self) -> bool {
        match self.open.take() {
            Some(transaction) if !transaction.is_empty() => {
                self.push_undo(transaction);
                true
            }
            _ => false,
        }
    }

    /// Pop the newest undo step, committing the open transaction first.
    pub fn take_undo(&mut self) -> Option<Transaction> {
        self.commit();
        self.undo_stack.pop_back()
    }

    pub fn take_redo(&mut self) -> Option<Transaction> {
        self.redo_stack.pop()
    }

    pub fn push_redo(&mut self, transaction: Transaction) {
        if !transaction.is_empty() {
            self.redo_stack.push(transaction);
        }
    }

    /// Push an undo step without touching redo.
    pub fn push_undo(&mut self, transaction: Transaction) {
        if transaction.is_empty() {
            return;
        }
        self.undo_stack.push_back(transaction);
        while self.undo_stack.len() > self.capacity {
            self.undo_stack.pop_front();
        }
    }

    pub fn can_undo(&self) -> bool {
        self.open.as_ref().map_or(false, |t| !t.is_empty()) || !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo_stack.len()
    }

    pub fn has_open_transaction(&self) -> bool {
        self.open.is_some()
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.open = None;
    }
}
