use std::fmt;

use super::{Entity, FieldErrors};

/// Maximum number of snapshots retained per item.
pub const HISTORY_DEPTH: usize = 32;

/// List-local handle of an item. Never persisted; snapshot copies keep the
/// key of the live item they were cloned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey(pub(crate) u64);

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Relationship of an item to its last persisted form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemState {
    /// Created in memory, never stored.
    New,
    /// Stored, then edited.
    Changed,
    /// Matches the stored form.
    Clean,
    /// Stored, then deleted.
    Deleted,
    /// Created and deleted before it was ever stored.
    DelNew,
    /// Deleted and then brought back.
    Recovered,
}

impl ItemState {
    pub const ALL: [ItemState; 6] = [
        ItemState::New,
        ItemState::Changed,
        ItemState::Clean,
        ItemState::Deleted,
        ItemState::DelNew,
        ItemState::Recovered,
    ];

    /// Deleted, whether or not the item was ever stored.
    pub fn is_deleted(self) -> bool {
        matches!(self, ItemState::Deleted | ItemState::DelNew)
    }
}

/// UI-facing summary of whether an item or list is safe to persist.
///
/// Variants are ordered by precedence: aggregating over several items picks
/// the greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EditState {
    Clean,
    Valid,
    Dirty,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
struct Snapshot<T> {
    values: T,
    state: ItemState,
}

/// A change-tracked entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Item<T> {
    key: ItemKey,
    id: Option<i64>,
    values: T,
    history: Vec<Snapshot<T>>,
    state: ItemState,
    errors: FieldErrors,
    validated: bool,
}

impl<T: Entity> Item<T> {
    pub(crate) fn new(key: ItemKey, values: T) -> Self {
        Self {
            key,
            id: None,
            values,
            history: Vec::new(),
            state: ItemState::New,
            errors: FieldErrors::new(),
            validated: false,
        }
    }

    /// An item freshly read from a backend.
    pub(crate) fn loaded(key: ItemKey, id: i64, values: T) -> Self {
        Self {
            id: Some(id),
            state: ItemState::Clean,
            ..Self::new(key, values)
        }
    }

    /// Handle used to address this item in its list.
    pub fn key(&self) -> ItemKey {
        self.key
    }

    /// Persisted identity, `None` until the first insert has been committed.
    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn values(&self) -> &T {
        &self.values
    }

    /// Direct access to the values. Callers must call
    /// [`push_history`](Self::push_history) first and
    /// [`check_for_history`](Self::check_for_history) afterwards; prefer
    /// [`edit`](Self::edit).
    pub fn values_mut(&mut self) -> &mut T {
        &mut self.values
    }

    /// Lifecycle state relative to the stored form.
    pub fn state(&self) -> ItemState {
        self.state
    }

    pub fn is_deleted(&self) -> bool {
        self.state.is_deleted()
    }

    /// Snapshots the current values before a mutation.
    pub fn push_history(&mut self) {
        if self.history.len() >= HISTORY_DEPTH {
            // Keep the base snapshot so undo can always reach the stored values.
            self.history.remove(1);
        }
        self.history.push(Snapshot {
            values: self.values.clone(),
            state: self.state,
        });
        self.validated = false;
    }

    /// Restores the most recent snapshot. Returns `false` when there is none.
    pub fn pop_history(&mut self) -> bool {
        match self.history.pop() {
            Some(snapshot) => {
                self.values = snapshot.values;
                self.state = snapshot.state;
                self.validated = false;
                self.errors.clear();
                true
            }
            None => false,
        }
    }

    /// Reports whether the values differ from the top snapshot, discarding
    /// that snapshot when they do not, and updates the lifecycle state.
    pub fn check_for_history(&mut self) -> bool {
        let changed = match self.history.last() {
            Some(top) => top.values != self.values,
            None => false,
        };
        if !changed {
            self.history.pop();
        }

        match self.state {
            ItemState::Changed if self.history.is_empty() => self.state = ItemState::Clean,
            ItemState::Clean if !self.history.is_empty() => self.state = ItemState::Changed,
            _ => {}
        }
        changed
    }

    pub fn has_history(&self) -> bool {
        !self.history.is_empty()
    }

    /// Edited since the last settlement.
    pub fn has_changes(&self) -> bool {
        self.has_history()
    }

    /// Number of snapshots on the undo stack.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Drops every snapshot, keeping the current values and state.
    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Applies `mutate` inside a push/check pair. Returns whether anything
    /// actually changed.
    pub fn edit(&mut self, mutate: impl FnOnce(&mut T)) -> bool {
        self.push_history();
        mutate(&mut self.values);
        self.check_for_history()
    }

    /// Undoes every recorded edit.
    pub fn reset_history(&mut self) {
        while self.pop_history() {}
    }

    /// Marks the item deleted. Items that were never stored become
    /// [`ItemState::DelNew`] and are dropped without a write.
    pub fn delete(&mut self) {
        self.state = match self.state {
            ItemState::New | ItemState::DelNew => ItemState::DelNew,
            _ => ItemState::Deleted,
        };
    }

    /// Reverses [`delete`](Self::delete). Other states are left unchanged.
    pub fn recover(&mut self) {
        self.state = match self.state {
            ItemState::DelNew => ItemState::New,
            ItemState::Deleted => ItemState::Recovered,
            other => other,
        };
    }

    /// Runs the entity's field checks, replacing any previous errors.
    pub fn validate(&mut self) -> bool {
        self.errors.clear();
        self.values.validate(&mut self.errors);
        self.validated = true;
        self.errors.is_empty()
    }

    /// Records an error against `field`, replacing any earlier one.
    pub fn add_error(&mut self, field: &'static str, message: impl Into<String>) {
        self.errors.insert(field, message.into());
    }

    pub fn clear_errors(&mut self) {
        self.errors.clear();
        self.validated = false;
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Field errors from the last validation, keyed by field name.
    pub fn errors(&self) -> &FieldErrors {
        &self.errors
    }

    /// Whether synchronising would transmit or settle anything for this item.
    pub fn needs_save(&self) -> bool {
        self.state != ItemState::Clean || self.has_history()
    }

    /// Summary used to decide whether the item can be stored.
    pub fn edit_state(&self) -> EditState {
        if self.has_errors() {
            EditState::Error
        } else if !self.needs_save() {
            EditState::Clean
        } else if self.validated {
            EditState::Valid
        } else {
            EditState::Dirty
        }
    }

    /// A copy of this item detached from the live list.
    pub(crate) fn snapshot(&self) -> Self {
        self.clone()
    }

    pub(crate) fn with_key(mut self, key: ItemKey) -> Self {
        self.key = key;
        self
    }

    /// A copy presented as never stored, keeping the id.
    pub(crate) fn as_new(&self) -> Self {
        Self {
            key: self.key,
            id: self.id,
            values: self.values.clone(),
            history: Vec::new(),
            state: ItemState::New,
            errors: FieldErrors::new(),
            validated: false,
        }
    }

    /// Marks the item as matching its stored form.
    pub(crate) fn mark_clean(&mut self, id: Option<i64>) {
        if id.is_some() {
            self.id = id;
        }
        self.state = ItemState::Clean;
        self.history.clear();
        self.errors.clear();
        self.validated = false;
    }
}
