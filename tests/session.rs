use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use ledger_tools::config::LedgerConfig;
use ledger_tools::error::CANCELLED_MESSAGE;
use ledger_tools::io::database::Database;
use ledger_tools::model::{Account, AccountCategory, EntityKind, ItemState, TaxYear, Transaction};
use ledger_tools::progress::{CancelToken, ProgressController, ProgressStatus};
use ledger_tools::session::Session;
use ledger_tools::worker::run_with_progress;
use rust_decimal_macros::dec;
use tempfile::tempdir;

fn account(name: &str, category: AccountCategory) -> Account {
    Account {
        name: name.to_string(),
        category,
        opening_balance: dec!(0),
        closed: false,
    }
}

fn transfer(debit: &str, credit: &str, day: u32) -> Transaction {
    Transaction {
        date: NaiveDate::from_ymd_opt(2024, 5, day).expect("valid date"),
        debit: debit.to_string(),
        credit: credit.to_string(),
        amount: dec!(12.50),
        description: format!("transfer {day}"),
    }
}

fn populated_session(batch_size: i64) -> Session {
    let mut session = Session::new(LedgerConfig {
        batch_size,
        ..LedgerConfig::default()
    });
    let data = session.data_mut();
    data.tax_years.add(TaxYear {
        year: 2024,
        allowance: dec!(12570),
        basic_rate: dec!(0.20),
    });
    data.accounts.add(account("Current", AccountCategory::Current));
    data.accounts.add(account("Savings", AccountCategory::Savings));
    for day in 1..=5 {
        data.transactions.add(transfer("Savings", "Current", day));
    }
    session
}

fn open_database(path: &std::path::Path) -> Database {
    let db = Database::open(path).expect("database opened");
    db.create_schema().expect("schema created");
    db
}

#[test]
fn stored_session_reloads_from_disk() {
    let dir = tempdir().expect("temporary directory");
    let path = dir.path().join("ledger.db");
    let mut session = populated_session(3);
    let mut db = open_database(&path);
    session
        .store_database(&mut db, &mut ProgressController::detached())
        .expect("stored");
    assert!(!session.data().has_updates());
    drop(db);

    let db = open_database(&path);
    let mut reloaded = Session::default();
    reloaded
        .load_database(&db, &mut ProgressController::detached())
        .expect("loaded");
    assert!(session.data().diff(reloaded.data()).is_empty());
    assert_eq!(reloaded.data().count(EntityKind::Transaction), 5);
}

#[test]
fn account_and_its_transactions_delete_together() {
    let dir = tempdir().expect("temporary directory");
    let mut db = open_database(&dir.path().join("ledger.db"));
    let mut session = populated_session(0);
    session
        .store_database(&mut db, &mut ProgressController::detached())
        .expect("stored");

    let data = session.data_mut();
    let keys: Vec<_> = data
        .transactions
        .iter()
        .filter(|item| item.values().debit == "Savings")
        .map(|item| item.key())
        .collect();
    for key in keys {
        data.transactions.get_mut(key).expect("transaction").delete();
    }
    let savings = data.find_account("Savings").expect("savings").key();
    data.accounts.get_mut(savings).expect("savings item").delete();

    session
        .store_database(&mut db, &mut ProgressController::detached())
        .expect("deletes respect foreign keys");
    assert_eq!(db.count(EntityKind::Account).expect("count"), 1);
    assert_eq!(db.count(EntityKind::Transaction).expect("count"), 0);
    assert!(session.data().transactions.is_empty());
}

#[test]
fn cancelling_mid_store_reports_once_and_stops_writing() {
    let dir = tempdir().expect("temporary directory");
    let mut db = open_database(&dir.path().join("ledger.db"));
    let mut session = populated_session(10);

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let seen = Arc::new(Mutex::new(Vec::<ProgressStatus>::new()));
    let sink = Arc::clone(&seen);
    let mut ctl = ProgressController::new(cancel).with_publisher(move |status| {
        if status.stage == "Inserting accounts" {
            trigger.cancel();
        }
        sink.lock().expect("status log").push(status);
    });

    let err = session
        .store_database(&mut db, &mut ctl)
        .expect_err("store cancelled");
    assert!(err.is_cancelled());
    assert!(err.to_string().contains(CANCELLED_MESSAGE));
    assert_eq!(err.to_string().matches(CANCELLED_MESSAGE).count(), 1);

    assert_eq!(db.count(EntityKind::TaxYear).expect("count"), 1);
    assert_eq!(db.count(EntityKind::Account).expect("count"), 0);
    assert_eq!(db.count(EntityKind::Transaction).expect("count"), 0);

    let data = session.data();
    assert_eq!(data.tax_years.count_items(ItemState::Clean), 1);
    assert_eq!(data.accounts.count_items(ItemState::New), 2);
    assert!(
        seen.lock()
            .expect("status log")
            .iter()
            .all(|status| !status.stage.starts_with("Inserting transactions"))
    );
}

#[test]
fn store_runs_on_a_worker_thread() {
    let dir = tempdir().expect("temporary directory");
    let mut db = open_database(&dir.path().join("ledger.db"));
    let mut session = populated_session(2);
    let mut stages = Vec::new();

    let applied = run_with_progress(
        CancelToken::new(),
        1,
        |ctl| session.store_database(&mut db, ctl),
        |status| stages.push(status.stage.clone()),
    )
    .expect("stored");

    assert_eq!(applied, 8);
    assert_eq!(stages.first().map(String::as_str), Some("Inserting tax years"));
    assert_eq!(stages.last().map(String::as_str), Some("Deleting tax years"));
    assert_eq!(db.count(EntityKind::Transaction).expect("count"), 5);
}

#[test]
fn restore_replaces_database_contents() {
    let dir = tempdir().expect("temporary directory");
    let backup_path = dir.path().join("ledger.xlsx");
    let mut source_db = open_database(&dir.path().join("source.db"));
    let mut session = populated_session(4);
    session
        .store_database(&mut source_db, &mut ProgressController::detached())
        .expect("stored");
    session
        .create_backup(&backup_path, &mut ProgressController::detached())
        .expect("backup created");

    let mut target_db = open_database(&dir.path().join("target.db"));
    let mut stale = Session::default();
    stale.data_mut().accounts.add(account("Stale", AccountCategory::Cash));
    stale
        .store_database(&mut target_db, &mut ProgressController::detached())
        .expect("stale data stored");

    let mut restored = Session::default();
    restored
        .restore_backup(&backup_path, &mut ProgressController::detached())
        .expect("backup read");
    restored
        .restore_into_database(&mut target_db, &mut ProgressController::detached())
        .expect("restored");

    let mut reloaded = Session::default();
    reloaded
        .load_database(&target_db, &mut ProgressController::detached())
        .expect("loaded");
    assert!(session.data().diff(reloaded.data()).is_empty());
    assert!(reloaded.data().find_account("Stale").is_none());
}

#[test]
fn renaming_a_referenced_account_stores_with_its_transactions() {
    let dir = tempdir().expect("temporary directory");
    let path = dir.path().join("ledger.db");
    let mut db = open_database(&path);
    let mut session = populated_session(1);
    session
        .store_database(&mut db, &mut ProgressController::detached())
        .expect("stored");

    let data = session.data_mut();
    let current = data.find_account("Current").expect("current account").key();
    data.accounts
        .get_mut(current)
        .expect("current item")
        .edit(|account| account.name = "Everyday".to_string());
    let keys: Vec<_> = data
        .transactions
        .iter()
        .filter(|item| item.values().credit == "Current")
        .map(|item| item.key())
        .collect();
    for key in keys {
        data.transactions
            .get_mut(key)
            .expect("transaction")
            .edit(|txn| txn.credit = "Everyday".to_string());
    }

    session
        .store_database(&mut db, &mut ProgressController::detached())
        .expect("rename stored");
    assert!(!session.data().has_updates());
    drop(db);

    let mut reloaded = Session::default();
    reloaded
        .load_database(&open_database(&path), &mut ProgressController::detached())
        .expect("loaded");
    assert!(session.data().diff(reloaded.data()).is_empty());
    assert!(reloaded.data().find_account("Current").is_none());
    assert!(
        reloaded
            .data()
            .transactions
            .iter()
            .all(|item| item.values().credit == "Everyday")
    );
}
