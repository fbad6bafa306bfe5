use std::collections::BTreeSet;
use std::fmt;

use super::item::EditState;
use super::list::{DataList, ListStyle, Settled};
use super::{Account, Entity, EntityKind, TaxYear, Transaction};

/// One list per entity kind: everything a ledger file or database holds.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataSet {
    pub tax_years: DataList<TaxYear>,
    pub accounts: DataList<Account>,
    pub transactions: DataList<Transaction>,
}

impl DataSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list<T: Entity>(&self) -> &DataList<T> {
        T::list(self)
    }

    pub fn list_mut<T: Entity>(&mut self) -> &mut DataList<T> {
        T::list_mut(self)
    }

    /// Number of items held for `kind`.
    pub fn count(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::TaxYear => self.tax_years.len(),
            EntityKind::Account => self.accounts.len(),
            EntityKind::Transaction => self.transactions.len(),
        }
    }

    /// Items across every list.
    pub fn total_items(&self) -> usize {
        EntityKind::INSERT_ORDER
            .into_iter()
            .map(|kind| self.count(kind))
            .sum()
    }

    /// Whether any list holds changes not yet stored.
    pub fn has_updates(&self) -> bool {
        self.tax_years.has_updates()
            || self.accounts.has_updates()
            || self.transactions.has_updates()
    }

    /// Worst edit state over every list.
    pub fn edit_state(&self) -> EditState {
        self.tax_years
            .edit_state()
            .max(self.accounts.edit_state())
            .max(self.transactions.edit_state())
    }

    /// Validates every list, then checks that transactions only reference
    /// live accounts. Returns `true` when nothing is in error.
    pub fn validate(&mut self) -> bool {
        let mut valid = self.tax_years.validate();
        valid &= self.tax_years.validate_keys();
        valid &= self.accounts.validate();
        valid &= self.accounts.validate_keys();
        valid &= self.transactions.validate();

        let accounts: BTreeSet<String> = self
            .accounts
            .iter()
            .filter(|item| !item.is_deleted())
            .map(|item| item.values().name.clone())
            .collect();
        for item in self.transactions.iter_mut().filter(|item| !item.is_deleted()) {
            let debit = item.values().debit.clone();
            let credit = item.values().credit.clone();
            if !debit.is_empty() && !accounts.contains(&debit) {
                item.add_error("debit", format!("unknown account '{debit}'"));
                valid = false;
            }
            if !credit.is_empty() && !accounts.contains(&credit) {
                item.add_error("credit", format!("unknown account '{credit}'"));
                valid = false;
            }
        }
        valid
    }

    /// Private copy of every pending change.
    pub fn update_snapshot(&self) -> Self {
        Self {
            tax_years: self.tax_years.update_snapshot(),
            accounts: self.accounts.update_snapshot(),
            transactions: self.transactions.update_snapshot(),
        }
    }

    /// Every live item presented as new, for writing into an empty store.
    pub fn full_snapshot(&self) -> Self {
        Self {
            tax_years: self.tax_years.full_snapshot(),
            accounts: self.accounts.full_snapshot(),
            transactions: self.transactions.full_snapshot(),
        }
    }

    /// Routes a settlement to the list selected by its entity tag.
    pub fn settle(&mut self, settled: &Settled) -> bool {
        match settled.kind {
            EntityKind::TaxYear => self.tax_years.settle(settled),
            EntityKind::Account => self.accounts.settle(settled),
            EntityKind::Transaction => self.transactions.settle(settled),
        }
    }

    /// Applies settlements in order, returning how many took effect.
    pub fn apply_settlements<'a>(&mut self, settled: impl IntoIterator<Item = &'a Settled>) -> usize {
        settled
            .into_iter()
            .filter(|settled| self.settle(settled))
            .count()
    }

    /// Items that differ from `other`, matched by persisted id.
    pub fn diff(&self, other: &DataSet) -> DataSetDiff {
        DataSetDiff {
            tax_years: self.tax_years.diff(&other.tax_years),
            accounts: self.accounts.diff(&other.accounts),
            transactions: self.transactions.diff(&other.transactions),
        }
    }

    /// Live account with the given name.
    pub fn find_account(&self, name: &str) -> Option<&super::Item<Account>> {
        self.accounts.search_for(&name.to_string())
    }

    pub fn find_tax_year(&self, year: i32) -> Option<&super::Item<TaxYear>> {
        self.tax_years.search_for(&year)
    }
}

/// Members that differ between two data sets, one list per entity kind.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSetDiff {
    pub tax_years: DataList<TaxYear>,
    pub accounts: DataList<Account>,
    pub transactions: DataList<Transaction>,
}

impl Default for DataSetDiff {
    fn default() -> Self {
        Self {
            tax_years: DataList::with_style(ListStyle::Diff),
            accounts: DataList::with_style(ListStyle::Diff),
            transactions: DataList::with_style(ListStyle::Diff),
        }
    }
}

impl DataSetDiff {
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.tax_years.len() + self.accounts.len() + self.transactions.len()
    }
}

fn describe<T: Entity>(f: &mut fmt::Formatter<'_>, list: &DataList<T>) -> fmt::Result {
    for item in list.iter() {
        match item.id() {
            Some(id) => writeln!(f, "{} id {id}: {:?}", T::KIND, item.values())?,
            None => writeln!(f, "{} (unsaved): {:?}", T::KIND, item.values())?,
        }
    }
    Ok(())
}

impl fmt::Display for DataSetDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "no differences");
        }
        describe(f, &self.tax_years)?;
        describe(f, &self.accounts)?;
        describe(f, &self.transactions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::model::{AccountCategory, ItemState};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

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
            date: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            debit: debit.to_string(),
            credit: credit.to_string(),
            amount: dec!(25.00),
            description: "rent".to_string(),
        }
    }

    #[test]
    fn transactions_must_reference_known_accounts() {
        let mut data = DataSet::new();
        data.accounts.add(account("Bank"));
        let key = data.transactions.add(transfer("Bank", "Landlord"));

        assert!(!data.validate());
        let item = data.transactions.get(key).unwrap();
        assert!(item.errors().contains_key("credit"));
        assert!(!item.errors().contains_key("debit"));
        assert_eq!(data.edit_state(), EditState::Error);
    }

    #[test]
    fn deleted_accounts_do_not_satisfy_references() {
        let mut data = DataSet::new();
        let bank = data.accounts.push_loaded(1, account("Bank")).unwrap();
        data.accounts.push_loaded(2, account("Cash")).unwrap();
        data.transactions.add(transfer("Bank", "Cash"));
        assert!(data.validate());

        data.accounts.get_mut(bank).unwrap().delete();
        assert!(!data.validate());
    }

    #[test]
    fn diff_is_empty_for_identical_sets() {
        let mut data = DataSet::new();
        data.accounts.push_loaded(1, account("Bank")).unwrap();
        data.accounts.push_loaded(2, account("Cash")).unwrap();
        let copy = data.clone();
        assert!(data.diff(&copy).is_empty());

        let mut changed = copy;
        changed
            .accounts
            .find_by_id_mut(2)
            .unwrap()
            .edit(|a| a.closed = true);
        let diff = data.diff(&changed);
        assert_eq!(diff.accounts.len(), 1);
        assert_eq!(diff.accounts.first().unwrap().id(), Some(2));
        assert!(diff.to_string().contains("accounts id 2"));
    }

    #[test]
    fn full_snapshot_presents_items_as_new() {
        let mut data = DataSet::new();
        data.accounts.push_loaded(5, account("Bank")).unwrap();
        let snapshot = data.full_snapshot();
        let item = snapshot.accounts.first().unwrap();
        assert_eq!(item.state(), ItemState::New);
        assert_eq!(item.id(), Some(5));
    }
}
