//! Concrete ledger entities and their per-field validation rules.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;

use super::{DataList, DataSet, Entity, EntityKind, FieldErrors, FieldValue, Keyed, RowError, RowReader};

const MAX_NAME_LEN: usize = 40;
const MAX_DESCRIPTION_LEN: usize = 100;

/// Parameters of one tax year.
#[derive(Debug, Clone, PartialEq)]
pub struct TaxYear {
    pub year: i32,
    pub allowance: Decimal,
    pub basic_rate: Decimal,
}

impl Entity for TaxYear {
    const KIND: EntityKind = EntityKind::TaxYear;

    fn to_row(&self) -> Vec<FieldValue> {
        vec![
            FieldValue::Integer(i64::from(self.year)),
            FieldValue::Decimal(self.allowance),
            FieldValue::Decimal(self.basic_rate),
        ]
    }

    fn from_row(row: &[FieldValue]) -> Result<Self, RowError> {
        let reader = RowReader::new(Self::KIND, row)?;
        let year = i32::try_from(reader.integer(0)?)
            .map_err(|_| reader.domain(0, "year out of range"))?;
        Ok(Self {
            year,
            allowance: reader.decimal(1)?,
            basic_rate: reader.decimal(2)?,
        })
    }

    fn validate(&self, errors: &mut FieldErrors) {
        if !(1900..=2200).contains(&self.year) {
            errors.insert("year", format!("{} is not a plausible tax year", self.year));
        }
        if self.allowance < Decimal::ZERO {
            errors.insert("allowance", "allowance cannot be negative".to_string());
        }
        if self.basic_rate < Decimal::ZERO || self.basic_rate > Decimal::ONE {
            errors.insert("basic_rate", "rate must lie between 0 and 1".to_string());
        }
    }

    fn list(set: &DataSet) -> &DataList<Self> {
        &set.tax_years
    }

    fn list_mut(set: &mut DataSet) -> &mut DataList<Self> {
        &mut set.tax_years
    }
}

impl Keyed for TaxYear {
    type Key = i32;
    const KEY_FIELD: &'static str = "year";

    fn natural_key(&self) -> i32 {
        self.year
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountCategory {
    Current,
    Savings,
    Credit,
    Cash,
    Investment,
}

impl AccountCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountCategory::Current => "current",
            AccountCategory::Savings => "savings",
            AccountCategory::Credit => "credit",
            AccountCategory::Cash => "cash",
            AccountCategory::Investment => "investment",
        }
    }
}

impl fmt::Display for AccountCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountCategory {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "current" => Ok(AccountCategory::Current),
            "savings" => Ok(AccountCategory::Savings),
            "credit" => Ok(AccountCategory::Credit),
            "cash" => Ok(AccountCategory::Cash),
            "investment" => Ok(AccountCategory::Investment),
            other => Err(format!("unknown account category '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub name: String,
    pub category: AccountCategory,
    pub opening_balance: Decimal,
    pub closed: bool,
}

impl Entity for Account {
    const KIND: EntityKind = EntityKind::Account;

    fn to_row(&self) -> Vec<FieldValue> {
        vec![
            FieldValue::Text(self.name.clone()),
            FieldValue::Text(self.category.as_str().to_string()),
            FieldValue::Decimal(self.opening_balance),
            FieldValue::Bool(self.closed),
        ]
    }

    fn from_row(row: &[FieldValue]) -> Result<Self, RowError> {
        let reader = RowReader::new(Self::KIND, row)?;
        let category = reader
            .text(1)?
            .parse()
            .map_err(|message: String| reader.domain(1, message))?;
        Ok(Self {
            name: reader.text(0)?,
            category,
            opening_balance: reader.decimal(2)?,
            closed: reader.boolean(3)?,
        })
    }

    fn validate(&self, errors: &mut FieldErrors) {
        if self.name.is_empty() {
            errors.insert("name", "name is required".to_string());
        } else if self.name.trim() != self.name {
            errors.insert("name", "name has surrounding whitespace".to_string());
        } else if self.name.chars().count() > MAX_NAME_LEN {
            errors.insert("name", format!("name exceeds {MAX_NAME_LEN} characters"));
        }
        if self.category == AccountCategory::Credit && self.opening_balance > Decimal::ZERO {
            errors.insert(
                "opening_balance",
                "credit accounts cannot open in credit".to_string(),
            );
        }
    }

    fn list(set: &DataSet) -> &DataList<Self> {
        &set.accounts
    }

    fn list_mut(set: &mut DataSet) -> &mut DataList<Self> {
        &mut set.accounts
    }
}

impl Keyed for Account {
    type Key = String;
    const KEY_FIELD: &'static str = "name";

    fn natural_key(&self) -> String {
        self.name.clone()
    }
}

/// A transfer of `amount` from the `debit` account to the `credit` account,
/// both referenced by name.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub date: NaiveDate,
    pub debit: String,
    pub credit: String,
    pub amount: Decimal,
    pub description: String,
}

impl Entity for Transaction {
    const KIND: EntityKind = EntityKind::Transaction;

    fn to_row(&self) -> Vec<FieldValue> {
        vec![
            FieldValue::Date(self.date),
            FieldValue::Text(self.debit.clone()),
            FieldValue::Text(self.credit.clone()),
            FieldValue::Decimal(self.amount),
            FieldValue::Text(self.description.clone()),
        ]
    }

    fn from_row(row: &[FieldValue]) -> Result<Self, RowError> {
        let reader = RowReader::new(Self::KIND, row)?;
        Ok(Self {
            date: reader.date(0)?,
            debit: reader.text(1)?,
            credit: reader.text(2)?,
            amount: reader.decimal(3)?,
            description: reader.text(4)?,
        })
    }

    fn validate(&self, errors: &mut FieldErrors) {
        if self.debit.is_empty() {
            errors.insert("debit", "debit account is required".to_string());
        }
        if self.credit.is_empty() {
            errors.insert("credit", "credit account is required".to_string());
        } else if self.credit == self.debit {
            errors.insert("credit", "cannot transfer to the same account".to_string());
        }
        if self.amount <= Decimal::ZERO {
            errors.insert("amount", "amount must be positive".to_string());
        }
        if self.description.chars().count() > MAX_DESCRIPTION_LEN {
            errors.insert(
                "description",
                format!("description exceeds {MAX_DESCRIPTION_LEN} characters"),
            );
        }
    }

    fn list(set: &DataSet) -> &DataList<Self> {
        &set.transactions
    }

    fn list_mut(set: &mut DataSet) -> &mut DataList<Self> {
        &mut set.transactions
    }
}
