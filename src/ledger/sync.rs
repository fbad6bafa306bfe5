//! Batched reconciliation of pending item changes against a storage backend.
//!
//! The synchronizer drains an UPDATE snapshot in three fixed phases (insert,
//! update, delete), table by table, committing every `batch_size` statements
//! and settling the items of each committed batch.

use std::fmt;

use tracing::{debug, info, instrument, warn};

use crate::ledger::error::{LedgerError, Result};
use crate::ledger::model::{
    Account, DataSet, Entity, EntityKind, FieldValue, ItemKey, ItemState, SettleAction, Settled,
    TaxYear, Transaction,
};
use crate::ledger::progress::{Outcome, ProgressController};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Insert,
    Update,
    Delete,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Insert, Phase::Update, Phase::Delete];

    /// Whether an item in `state` is handled by this phase.
    pub fn matches(self, state: ItemState) -> bool {
        match self {
            Phase::Insert => state == ItemState::New,
            Phase::Update => matches!(state, ItemState::Changed | ItemState::Recovered),
            Phase::Delete => matches!(state, ItemState::Deleted | ItemState::DelNew),
        }
    }

    /// Tables in the order this phase must visit them.
    pub fn tables(self) -> Vec<EntityKind> {
        match self {
            Phase::Insert | Phase::Update => EntityKind::INSERT_ORDER.to_vec(),
            Phase::Delete => EntityKind::delete_order().collect(),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Insert => write!(f, "Inserting"),
            Phase::Update => write!(f, "Updating"),
            Phase::Delete => write!(f, "Deleting"),
        }
    }
}

/// A store that accepts positional row writes grouped into batches.
///
/// Writes issued after the last `commit` form the active batch; `rollback`
/// discards it.
pub trait Backend {
    /// Readies the parameterized statement for `phase` on `kind`.
    fn prepare(&mut self, kind: EntityKind, phase: Phase) -> Result<()>;

    /// Stores a row and returns its id. A supplied id is kept, otherwise the
    /// backend assigns one.
    fn insert(&mut self, kind: EntityKind, id: Option<i64>, row: &[FieldValue]) -> Result<i64>;

    fn update(&mut self, kind: EntityKind, id: i64, row: &[FieldValue]) -> Result<()>;

    fn delete(&mut self, kind: EntityKind, id: i64) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;
}

/// Drains pending changes into a [`Backend`].
#[derive(Debug)]
pub struct BatchSynchronizer {
    batch_limit: Option<usize>,
    pending: Vec<Settled>,
    settled: Vec<Settled>,
    writes: usize,
    commits: usize,
}

impl BatchSynchronizer {
    /// One stage per table per phase.
    pub const STAGE_COUNT: usize = Phase::ALL.len() * EntityKind::INSERT_ORDER.len();

    /// `batch_size <= 0` defers the only commit to the end of the run.
    pub fn new(batch_size: i64) -> Self {
        Self {
            batch_limit: usize::try_from(batch_size).ok().filter(|size| *size > 0),
            pending: Vec::new(),
            settled: Vec::new(),
            writes: 0,
            commits: 0,
        }
    }

    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn commits(&self) -> usize {
        self.commits
    }

    /// Every settlement of committed batches, in commit order.
    pub fn settled(&self) -> &[Settled] {
        &self.settled
    }

    pub fn take_settled(&mut self) -> Vec<Settled> {
        std::mem::take(&mut self.settled)
    }

    /// Writes every pending change held in `snapshot` to `backend`.
    ///
    /// Committed batches stay committed when a later write fails; the batch
    /// in progress is rolled back and the error returned. Settled items are
    /// updated in `snapshot` and recorded in [`settled`](Self::settled).
    #[instrument(level = "info", skip_all, fields(batch_limit = ?self.batch_limit))]
    pub fn store<B: Backend>(
        &mut self,
        snapshot: &mut DataSet,
        backend: &mut B,
        ctl: &mut ProgressController,
    ) -> Result<Outcome> {
        for phase in Phase::ALL {
            for kind in phase.tables() {
                let result = match kind {
                    EntityKind::TaxYear => self.sync_table::<TaxYear, B>(phase, snapshot, backend, ctl),
                    EntityKind::Account => self.sync_table::<Account, B>(phase, snapshot, backend, ctl),
                    EntityKind::Transaction => {
                        self.sync_table::<Transaction, B>(phase, snapshot, backend, ctl)
                    }
                };
                match result {
                    Ok(Outcome::Completed(())) => {}
                    Ok(Outcome::Cancelled) => {
                        info!(%phase, %kind, "synchronisation cancelled");
                        self.abort(backend);
                        return Ok(Outcome::Cancelled);
                    }
                    Err(error) => {
                        warn!(%phase, %kind, %error, "synchronisation failed");
                        self.abort(backend);
                        return Err(error);
                    }
                }
            }
        }

        if !self.pending.is_empty() {
            if let Err(error) = self.commit(snapshot, backend) {
                self.abort(backend);
                return Err(error);
            }
        }

        info!(
            writes = self.writes,
            commits = self.commits,
            settled = self.settled.len(),
            "synchronisation complete"
        );
        Ok(Outcome::Completed(()))
    }

    fn sync_table<T: Entity, B: Backend>(
        &mut self,
        phase: Phase,
        snapshot: &mut DataSet,
        backend: &mut B,
        ctl: &mut ProgressController,
    ) -> Result<Outcome> {
        if !ctl.set_new_stage(format!("{phase} {}", T::KIND)) {
            return Ok(Outcome::Cancelled);
        }

        let targets: Vec<(ItemKey, ItemState)> = T::list(snapshot)
            .iter()
            .filter(|item| phase.matches(item.state()))
            .map(|item| (item.key(), item.state()))
            .collect();
        if targets.is_empty() {
            return Ok(Outcome::Completed(()));
        }
        if !ctl.set_num_steps(targets.len()) {
            return Ok(Outcome::Cancelled);
        }

        let transmits = targets
            .iter()
            .any(|(_, state)| *state != ItemState::DelNew);
        if transmits {
            backend.prepare(T::KIND, phase)?;
        }
        debug!(%phase, kind = %T::KIND, items = targets.len(), "table phase started");

        for (done, (key, state)) in targets.into_iter().enumerate() {
            if state == ItemState::DelNew {
                let settled = Settled {
                    kind: T::KIND,
                    key,
                    id: None,
                    expected: state,
                    action: SettleAction::Unlink,
                };
                snapshot.settle(&settled);
                self.settled.push(settled);
            } else {
                let settled = self.write_item::<T, B>(phase, key, snapshot, backend)?;
                self.writes += 1;
                self.pending.push(settled);
                if self
                    .batch_limit
                    .is_some_and(|limit| self.pending.len() >= limit)
                {
                    self.commit(snapshot, backend)?;
                }
            }

            if !ctl.set_steps_done(done + 1) {
                return Ok(Outcome::Cancelled);
            }
        }

        if self.batch_limit.is_some() && !self.pending.is_empty() {
            self.commit(snapshot, backend)?;
        }
        Ok(Outcome::Completed(()))
    }

    fn write_item<T: Entity, B: Backend>(
        &self,
        phase: Phase,
        key: ItemKey,
        snapshot: &DataSet,
        backend: &mut B,
    ) -> Result<Settled> {
        let item = T::list(snapshot).get(key).ok_or_else(|| {
            LedgerError::consistency(format!("item {key} vanished from the {} snapshot", T::KIND))
        })?;
        let stored_id = || {
            item.id().ok_or_else(|| {
                LedgerError::consistency(format!(
                    "{} item {key} was never stored but is marked {:?}",
                    T::KIND,
                    item.state()
                ))
            })
        };

        let (id, action) = match phase {
            Phase::Insert => {
                let row = item.values().to_row();
                (backend.insert(T::KIND, item.id(), &row)?, SettleAction::Clean)
            }
            Phase::Update => {
                let id = stored_id()?;
                backend.update(T::KIND, id, &item.values().to_row())?;
                (id, SettleAction::Clean)
            }
            Phase::Delete => {
                let id = stored_id()?;
                backend.delete(T::KIND, id)?;
                (id, SettleAction::Unlink)
            }
        };

        Ok(Settled {
            kind: T::KIND,
            key,
            id: Some(id),
            expected: item.state(),
            action,
        })
    }

    fn commit<B: Backend>(&mut self, snapshot: &mut DataSet, backend: &mut B) -> Result<()> {
        backend.commit()?;
        self.commits += 1;
        debug!(batch = self.pending.len(), commits = self.commits, "batch committed");
        for settled in self.pending.drain(..) {
            snapshot.settle(&settled);
            self.settled.push(settled);
        }
        Ok(())
    }

    fn abort<B: Backend>(&mut self, backend: &mut B) {
        if let Err(error) = backend.rollback() {
            warn!(%error, "rollback of the active batch failed");
        }
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::error::ErrorKind;
    use crate::ledger::model::AccountCategory;
    use crate::ledger::progress::CancelToken;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Op {
        Insert(EntityKind, i64),
        Update(EntityKind, i64),
        Delete(EntityKind, i64),
        Commit,
        Rollback,
    }

    /// Backend double that records every call.
    #[derive(Debug, Default)]
    struct RecordingBackend {
        ops: Vec<Op>,
        prepared: Vec<(EntityKind, Phase)>,
        next_id: i64,
        writes: usize,
        /// Fail the n-th write (1-based).
        fail_on_write: Option<usize>,
        /// Tripped on the first commit.
        cancel_on_commit: Option<CancelToken>,
    }

    impl RecordingBackend {
        fn commits(&self) -> usize {
            self.ops.iter().filter(|op| **op == Op::Commit).count()
        }

        fn writes(&self) -> usize {
            self.ops
                .iter()
                .filter(|op| !matches!(op, Op::Commit | Op::Rollback))
                .count()
        }

        fn write(&mut self) -> Result<()> {
            self.writes += 1;
            if self.fail_on_write == Some(self.writes) {
                return Err(LedgerError::persistence("simulated write failure"));
            }
            Ok(())
        }
    }

    impl Backend for RecordingBackend {
        fn prepare(&mut self, kind: EntityKind, phase: Phase) -> Result<()> {
            self.prepared.push((kind, phase));
            Ok(())
        }

        fn insert(&mut self, kind: EntityKind, id: Option<i64>, _row: &[FieldValue]) -> Result<i64> {
            self.write()?;
            let id = id.unwrap_or_else(|| {
                self.next_id += 1;
                100 + self.next_id
            });
            self.ops.push(Op::Insert(kind, id));
            Ok(id)
        }

        fn update(&mut self, kind: EntityKind, id: i64, _row: &[FieldValue]) -> Result<()> {
            self.write()?;
            self.ops.push(Op::Update(kind, id));
            Ok(())
        }

        fn delete(&mut self, kind: EntityKind, id: i64) -> Result<()> {
            self.write()?;
            self.ops.push(Op::Delete(kind, id));
            Ok(())
        }

        fn commit(&mut self) -> Result<()> {
            self.ops.push(Op::Commit);
            if let Some(token) = &self.cancel_on_commit {
                token.cancel();
            }
            Ok(())
        }

        fn rollback(&mut self) -> Result<()> {
            self.ops.push(Op::Rollback);
            Ok(())
        }
    }

    fn account(name: &str) -> Account {
        Account {
            name: name.to_string(),
            category: AccountCategory::Current,
            opening_balance: dec!(0),
            closed: false,
        }
    }

    fn transfer(debit: &str, credit: &str) -> Transaction {
        Transaction {
            date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            debit: debit.to_string(),
            credit: credit.to_string(),
            amount: dec!(12.34),
            description: String::new(),
        }
    }

    fn with_new_accounts(count: usize) -> DataSet {
        let mut data = DataSet::new();
        for index in 0..count {
            data.accounts.add(account(&format!("Account {index}")));
        }
        data
    }

    fn run(
        batch_size: i64,
        live: &mut DataSet,
        backend: &mut RecordingBackend,
    ) -> (BatchSynchronizer, Result<Outcome>) {
        let mut snapshot = live.update_snapshot();
        let mut sync = BatchSynchronizer::new(batch_size);
        let mut ctl = ProgressController::detached();
        assert!(ctl.set_num_stages(BatchSynchronizer::STAGE_COUNT));
        let result = sync.store(&mut snapshot, backend, &mut ctl);
        live.apply_settlements(sync.settled());
        (sync, result)
    }

    #[test]
    fn three_new_accounts_in_batches_of_two() {
        let mut live = with_new_accounts(3);
        let mut backend = RecordingBackend::default();
        let (sync, result) = run(2, &mut live, &mut backend);

        assert_eq!(result.unwrap(), Outcome::Completed(()));
        assert_eq!(backend.commits(), 2);
        assert_eq!(sync.commits(), 2);
        assert_eq!(backend.writes(), sync.writes());
        assert_eq!(
            backend.ops,
            vec![
                Op::Insert(EntityKind::Account, 101),
                Op::Insert(EntityKind::Account, 102),
                Op::Commit,
                Op::Insert(EntityKind::Account, 103),
                Op::Commit,
            ]
        );
        for item in live.accounts.iter() {
            assert_eq!(item.state(), ItemState::Clean);
            assert!(!item.has_history());
            assert!(item.id().is_some());
        }
    }

    #[test]
    fn commit_count_is_ceiling_of_batches() {
        for (batch_size, expected) in [(1, 7), (3, 3), (7, 1), (50, 1), (0, 1), (-1, 1)] {
            let mut live = with_new_accounts(7);
            let mut backend = RecordingBackend::default();
            let (_, result) = run(batch_size, &mut live, &mut backend);
            assert!(result.is_ok());
            assert_eq!(backend.commits(), expected, "batch size {batch_size}");
            assert_eq!(live.accounts.count_items(ItemState::Clean), 7);
        }
    }

    #[test]
    fn empty_change_set_touches_nothing() {
        let mut live = DataSet::new();
        live.accounts.push_loaded(1, account("Stored")).unwrap();
        for batch_size in [0, 10] {
            let mut backend = RecordingBackend::default();
            let (sync, result) = run(batch_size, &mut live, &mut backend);
            assert!(result.is_ok());
            assert!(backend.ops.is_empty());
            assert!(backend.prepared.is_empty());
            assert_eq!(sync.writes(), 0);
        }
    }

    #[test]
    fn inserts_follow_dependencies_and_deletes_reverse_them() {
        let mut live = DataSet::new();
        let old_account = live.accounts.push_loaded(1, account("Old")).unwrap();
        let old_txn = live.transactions.push_loaded(1, transfer("Old", "Bank")).unwrap();
        live.transactions.add(transfer("Bank", "Cash"));
        live.accounts.add(account("Cash"));
        live.accounts.get_mut(old_account).unwrap().delete();
        live.transactions.get_mut(old_txn).unwrap().delete();

        let mut backend = RecordingBackend::default();
        let (_, result) = run(0, &mut live, &mut backend);
        assert!(result.is_ok());
        assert_eq!(
            backend.ops,
            vec![
                Op::Insert(EntityKind::Account, 101),
                Op::Insert(EntityKind::Transaction, 102),
                Op::Delete(EntityKind::Transaction, 1),
                Op::Delete(EntityKind::Account, 1),
                Op::Commit,
            ]
        );
        assert_eq!(live.accounts.len(), 1);
        assert_eq!(live.transactions.len(), 1);
    }

    #[test]
    fn updates_cover_changed_and_recovered_items() {
        let mut live = DataSet::new();
        let changed = live.accounts.push_loaded(4, account("Edited")).unwrap();
        let recovered = live.accounts.push_loaded(5, account("Restored")).unwrap();
        live.accounts.get_mut(changed).unwrap().edit(|a| a.closed = true);
        let item = live.accounts.get_mut(recovered).unwrap();
        item.delete();
        item.recover();

        let mut backend = RecordingBackend::default();
        let (_, result) = run(10, &mut live, &mut backend);
        assert!(result.is_ok());
        assert_eq!(
            backend.ops,
            vec![
                Op::Update(EntityKind::Account, 4),
                Op::Update(EntityKind::Account, 5),
                Op::Commit,
            ]
        );
        assert_eq!(live.accounts.count_items(ItemState::Clean), 2);
    }

    #[test]
    fn delnew_items_are_settled_without_writes() {
        let mut live = DataSet::new();
        let key = live.accounts.add(account("Mistake"));
        live.accounts.get_mut(key).unwrap().delete();

        let mut backend = RecordingBackend::default();
        let (sync, result) = run(5, &mut live, &mut backend);
        assert!(result.is_ok());
        assert!(backend.ops.is_empty());
        assert!(backend.prepared.is_empty());
        assert_eq!(sync.settled().len(), 1);
        assert!(live.accounts.is_empty());
    }

    #[test]
    fn failure_keeps_committed_batches_and_rolls_back_the_rest() {
        let mut live = with_new_accounts(5);
        let mut backend = RecordingBackend {
            fail_on_write: Some(4),
            ..RecordingBackend::default()
        };
        let (sync, result) = run(2, &mut live, &mut backend);

        let error = result.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Persistence);
        assert_eq!(sync.commits(), 1);
        assert_eq!(backend.ops.last(), Some(&Op::Rollback));
        assert_eq!(live.accounts.count_items(ItemState::Clean), 2);
        assert_eq!(live.accounts.count_items(ItemState::New), 3);
    }

    #[test]
    fn cancellation_before_a_stage_stops_all_later_writes() {
        let token = CancelToken::new();
        let mut live = with_new_accounts(2);
        live.transactions.add(transfer("Account 0", "Account 1"));
        let mut backend = RecordingBackend {
            cancel_on_commit: Some(token.clone()),
            ..RecordingBackend::default()
        };

        let mut snapshot = live.update_snapshot();
        let mut sync = BatchSynchronizer::new(5);
        let mut ctl = ProgressController::new(token);
        assert!(ctl.set_num_stages(BatchSynchronizer::STAGE_COUNT));
        let outcome = sync.store(&mut snapshot, &mut backend, &mut ctl).unwrap();
        live.apply_settlements(sync.settled());

        assert!(outcome.is_cancelled());
        assert!(
            !backend
                .ops
                .iter()
                .any(|op| matches!(op, Op::Insert(EntityKind::Transaction, _)))
        );
        assert_eq!(live.accounts.count_items(ItemState::Clean), 2);
        assert_eq!(live.transactions.count_items(ItemState::New), 1);

        let error = outcome.into_result().unwrap_err();
        assert!(error.is_cancelled());
    }

    #[test]
    fn settlement_skips_items_edited_after_the_snapshot() {
        let mut live = with_new_accounts(1);
        let mut snapshot = live.update_snapshot();
        let key = live.accounts.first().unwrap().key();
        live.accounts.get_mut(key).unwrap().delete();

        let mut backend = RecordingBackend::default();
        let mut sync = BatchSynchronizer::new(1);
        let mut ctl = ProgressController::detached();
        let outcome = sync.store(&mut snapshot, &mut backend, &mut ctl).unwrap();
        assert_eq!(outcome, Outcome::Completed(()));

        assert_eq!(live.apply_settlements(sync.settled()), 0);
        assert_eq!(live.accounts.get(key).unwrap().state(), ItemState::DelNew);
        assert_eq!(snapshot.accounts.first().unwrap().state(), ItemState::Clean);
    }
}
