use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use super::item::{EditState, Item, ItemKey, ItemState};
use super::{Entity, EntityKind, Keyed};
use crate::ledger::error::{LedgerError, Result};

/// How a list was built, which decides what it may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListStyle {
    /// Live, user-editable list.
    Edit,
    /// Private copy of the pending changes taken before a synchronisation.
    Update,
    /// Members that differ between two data sets.
    Diff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateFilter {
    All,
    Only(ItemState),
}

impl From<ItemState> for StateFilter {
    fn from(state: ItemState) -> Self {
        StateFilter::Only(state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleAction {
    /// Stored successfully: mark clean and adopt the id.
    Clean,
    /// Removed from the store (or never stored): drop from the list.
    Unlink,
}

/// Outcome of a committed write for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settled {
    pub kind: EntityKind,
    pub key: ItemKey,
    pub id: Option<i64>,
    /// State the item was in when the write was issued.
    pub expected: ItemState,
    pub action: SettleAction,
}

/// Ordered, id-unique collection of change-tracked items.
///
/// Items are held by key. Keys are handed out in increasing order and
/// snapshot copies keep theirs, so key order is list order. A second index
/// maps persisted ids to keys.
#[derive(Debug, Clone, PartialEq)]
pub struct DataList<T> {
    style: ListStyle,
    items: BTreeMap<ItemKey, Item<T>>,
    ids: HashMap<i64, ItemKey>,
    next_key: u64,
}

impl<T: Entity> Default for DataList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> DataList<T> {
    /// An empty, user-editable list.
    pub fn new() -> Self {
        Self::with_style(ListStyle::Edit)
    }

    /// An empty list with the given role.
    pub fn with_style(style: ListStyle) -> Self {
        Self {
            style,
            items: BTreeMap::new(),
            ids: HashMap::new(),
            next_key: 1,
        }
    }

    pub fn style(&self) -> ListStyle {
        self.style
    }

    /// Entity kind stored in this list.
    pub fn kind(&self) -> EntityKind {
        T::KIND
    }

    /// Number of items, deleted ones included.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn allocate_key(&mut self) -> ItemKey {
        let key = ItemKey(self.next_key);
        self.next_key += 1;
        key
    }

    fn insert(&mut self, item: Item<T>) {
        if let Some(id) = item.id() {
            self.ids.insert(id, item.key());
        }
        self.items.insert(item.key(), item);
    }

    /// Adds an unsaved item.
    pub fn add(&mut self, values: T) -> ItemKey {
        let key = self.allocate_key();
        self.insert(Item::new(key, values));
        key
    }

    /// Adds an item read from a backend. Fails when `id` is already held.
    pub fn push_loaded(&mut self, id: i64, values: T) -> Result<ItemKey> {
        if self.ids.contains_key(&id) {
            return Err(LedgerError::consistency(format!(
                "duplicate id {id} in {}",
                T::KIND
            )));
        }
        let key = self.allocate_key();
        self.insert(Item::loaded(key, id, values));
        Ok(key)
    }

    fn push_copy(&mut self, item: Item<T>) {
        self.next_key = self.next_key.max(item.key().0 + 1);
        self.insert(item);
    }

    /// Items in list order.
    pub fn iter(&self) -> impl Iterator<Item = &Item<T>> {
        self.items.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Item<T>> {
        self.items.values_mut()
    }

    /// The first item in list order.
    pub fn first(&self) -> Option<&Item<T>> {
        self.items.values().next()
    }

    /// The item following `key` in list order.
    pub fn next_after(&self, key: ItemKey) -> Option<&Item<T>> {
        if !self.items.contains_key(&key) {
            return None;
        }
        self.items
            .range((Bound::Excluded(key), Bound::Unbounded))
            .map(|(_, item)| item)
            .next()
    }

    /// Looks up an item by its list-local key.
    pub fn get(&self, key: ItemKey) -> Option<&Item<T>> {
        self.items.get(&key)
    }

    /// Mutable lookup by key. Edits should go through [`Item::edit`].
    pub fn get_mut(&mut self, key: ItemKey) -> Option<&mut Item<T>> {
        self.items.get_mut(&key)
    }

    /// Looks up an item by its persisted id.
    pub fn find_by_id(&self, id: i64) -> Option<&Item<T>> {
        self.ids.get(&id).and_then(|key| self.items.get(key))
    }

    pub fn find_by_id_mut(&mut self, id: i64) -> Option<&mut Item<T>> {
        let key = *self.ids.get(&id)?;
        self.items.get_mut(&key)
    }

    /// Drops an item from the list without touching any store.
    pub fn remove(&mut self, key: ItemKey) -> Option<Item<T>> {
        let item = self.items.remove(&key)?;
        if let Some(id) = item.id() {
            if self.ids.get(&id) == Some(&key) {
                self.ids.remove(&id);
            }
        }
        Some(item)
    }

    /// Number of items matching `filter`; a bare [`ItemState`] selects that
    /// state only.
    pub fn count_items(&self, filter: impl Into<StateFilter>) -> usize {
        match filter.into() {
            StateFilter::All => self.items.len(),
            StateFilter::Only(state) => self.iter().filter(|i| i.state() == state).count(),
        }
    }

    /// Copies of every item that is not clean, detached from this list.
    pub fn update_snapshot(&self) -> Self {
        let mut snapshot = Self::with_style(ListStyle::Update);
        for item in self.iter().filter(|item| item.state() != ItemState::Clean) {
            snapshot.push_copy(item.snapshot());
        }
        snapshot.next_key = snapshot.next_key.max(self.next_key);
        snapshot
    }

    /// Every live item presented as new, ids kept. Used to write a complete
    /// copy of the list to an empty store.
    pub fn full_snapshot(&self) -> Self {
        let mut snapshot = Self::with_style(ListStyle::Update);
        for item in self.iter().filter(|item| !item.is_deleted()) {
            snapshot.push_copy(item.as_new());
        }
        snapshot.next_key = snapshot.next_key.max(self.next_key);
        snapshot
    }

    /// Applies a committed write. Items whose state moved on since the write
    /// was issued are left alone.
    pub fn settle(&mut self, settled: &Settled) -> bool {
        let Some(item) = self.items.get_mut(&settled.key) else {
            return false;
        };
        if item.state() != settled.expected {
            return false;
        }
        match settled.action {
            SettleAction::Clean => {
                item.mark_clean(settled.id);
                if let Some(id) = item.id() {
                    self.ids.insert(id, settled.key);
                }
            }
            SettleAction::Unlink => {
                self.remove(settled.key);
            }
        }
        true
    }

    /// Whether any item still has something to store.
    pub fn has_updates(&self) -> bool {
        self.iter().any(Item::needs_save)
    }

    /// Worst edit state of any member, [`EditState::Clean`] when empty.
    pub fn edit_state(&self) -> EditState {
        self.iter()
            .map(Item::edit_state)
            .max()
            .unwrap_or(EditState::Clean)
    }

    /// Validates every live item. Returns `true` when none has errors.
    pub fn validate(&mut self) -> bool {
        let mut valid = true;
        for item in self.iter_mut() {
            if item.is_deleted() {
                item.clear_errors();
                continue;
            }
            valid &= item.validate();
        }
        valid
    }

    /// Members of `self` and `other` that are missing from, or differ in,
    /// the other list. Items are matched by persisted id.
    pub fn diff(&self, other: &Self) -> Self {
        let mut diff = Self::with_style(ListStyle::Diff);
        for item in self.iter().filter(|item| !item.is_deleted()) {
            let matched = item
                .id()
                .and_then(|id| other.find_by_id(id))
                .filter(|peer| !peer.is_deleted());
            match matched {
                Some(peer) if peer.values() == item.values() => {}
                _ => diff.push_diff(item.clone()),
            }
        }
        for item in other.iter().filter(|item| !item.is_deleted()) {
            let present = item
                .id()
                .and_then(|id| self.find_by_id(id))
                .is_some_and(|peer| !peer.is_deleted());
            if !present {
                diff.push_diff(item.clone());
            }
        }
        diff
    }

    fn push_diff(&mut self, item: Item<T>) {
        let key = self.allocate_key();
        self.insert(item.with_key(key));
    }
}

impl<T: Keyed> DataList<T> {
    /// Looks up a live item by natural key.
    pub fn search_for(&self, key: &T::Key) -> Option<&Item<T>> {
        self.iter()
            .filter(|item| !item.is_deleted())
            .find(|item| &item.values().natural_key() == key)
    }

    /// Flags every live item whose natural key is shared with another.
    pub fn validate_keys(&mut self) -> bool {
        let mut seen: BTreeMap<T::Key, usize> = BTreeMap::new();
        for item in self.iter().filter(|item| !item.is_deleted()) {
            *seen.entry(item.values().natural_key()).or_default() += 1;
        }
        let mut valid = true;
        for item in self.iter_mut().filter(|item| !item.is_deleted()) {
            let key = item.values().natural_key();
            if seen.get(&key).copied().unwrap_or_default() > 1 {
                item.add_error(T::KEY_FIELD, format!("{key:?} is not unique"));
                valid = false;
            }
        }
        valid
    }
}
