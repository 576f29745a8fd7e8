//! Double-entry bookkeeping types: chart of accounts and journal entries.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Account classification, which fixes the account's normal balance side.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountType {
	Asset,
	Liability,
	Equity,
	Revenue,
	Cogs,
	Expense,
}

impl AccountType {
	/// Asset, expense and cost-of-goods accounts grow with debits.
	pub fn is_debit_normal(&self) -> bool {
		matches!(self, AccountType::Asset | AccountType::Expense | AccountType::Cogs)
	}

	/// Signed balance change produced by one journal line.
	///
	/// ASSET/EXPENSE/COGS: `debit - credit`; LIABILITY/EQUITY/REVENUE: `credit - debit`.
	pub fn balance_delta(&self, debit: Decimal, credit: Decimal) -> Decimal {
		if self.is_debit_normal() {
			debit - credit
		} else {
			credit - debit
		}
	}
}

impl fmt::Display for AccountType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			AccountType::Asset => "ASSET",
			AccountType::Liability => "LIABILITY",
			AccountType::Equity => "EQUITY",
			AccountType::Revenue => "REVENUE",
			AccountType::Cogs => "COGS",
			AccountType::Expense => "EXPENSE",
		};
		f.write_str(s)
	}
}

/// Semantic role of an account, used by posting templates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MappingKey {
	PrimaryBank,
	CustomerDeposit,
	SalesRevenue,
	PoRevenue,
	OperatingExpense,
	OwnerEquity,
}

impl MappingKey {
	pub fn as_str(&self) -> &'static str {
		match self {
			MappingKey::PrimaryBank => "PRIMARY_BANK",
			MappingKey::CustomerDeposit => "CUSTOMER_DEPOSIT",
			MappingKey::SalesRevenue => "SALES_REVENUE",
			MappingKey::PoRevenue => "PO_REVENUE",
			MappingKey::OperatingExpense => "OPERATING_EXPENSE",
			MappingKey::OwnerEquity => "OWNER_EQUITY",
		}
	}
}

impl fmt::Display for MappingKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for MappingKey {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"PRIMARY_BANK" => Ok(Self::PrimaryBank),
			"CUSTOMER_DEPOSIT" => Ok(Self::CustomerDeposit),
			"SALES_REVENUE" => Ok(Self::SalesRevenue),
			"PO_REVENUE" => Ok(Self::PoRevenue),
			"OPERATING_EXPENSE" => Ok(Self::OperatingExpense),
			"OWNER_EQUITY" => Ok(Self::OwnerEquity),
			other => Err(format!("unknown mapping key '{}'", other)),
		}
	}
}

/// An account in the chart of accounts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChartOfAccount {
	/// Unique account code, e.g. "1002".
	pub code: String,
	pub name: String,
	pub account_type: AccountType,
	/// Running balance in the account's normal direction.
	pub balance: Decimal,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub mapping_key: Option<MappingKey>,
}

/// An account to open when the chart is seeded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountSeed {
	pub code: String,
	pub name: String,
	#[serde(rename = "type")]
	pub account_type: AccountType,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub mapping_key: Option<MappingKey>,
}

impl AccountSeed {
	pub fn new(
		code: impl Into<String>,
		name: impl Into<String>,
		account_type: AccountType,
		mapping_key: Option<MappingKey>,
	) -> Self {
		Self {
			code: code.into(),
			name: name.into(),
			account_type,
			mapping_key,
		}
	}
}

/// The chart every shop starts with.
pub fn default_chart() -> Vec<AccountSeed> {
	vec![
		AccountSeed::new("1002", "Primary Bank", AccountType::Asset, Some(MappingKey::PrimaryBank)),
		AccountSeed::new(
			"2001",
			"Customer Deposits",
			AccountType::Liability,
			Some(MappingKey::CustomerDeposit),
		),
		AccountSeed::new("3001", "Owner Equity", AccountType::Equity, Some(MappingKey::OwnerEquity)),
		AccountSeed::new("4001", "Sales Revenue", AccountType::Revenue, Some(MappingKey::SalesRevenue)),
		AccountSeed::new("4002", "Pre-Order Revenue", AccountType::Revenue, Some(MappingKey::PoRevenue)),
		AccountSeed::new("5001", "Cost of Goods Sold", AccountType::Cogs, None),
		AccountSeed::new(
			"6001",
			"Operating Expenses",
			AccountType::Expense,
			Some(MappingKey::OperatingExpense),
		),
	]
}

/// What a journal entry refers back to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
	Order,
	Invoice,
	Expense,
	Reversal,
	Manual,
}

impl fmt::Display for ReferenceType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			ReferenceType::Order => "order",
			ReferenceType::Invoice => "invoice",
			ReferenceType::Expense => "expense",
			ReferenceType::Reversal => "reversal",
			ReferenceType::Manual => "manual",
		};
		f.write_str(s)
	}
}

/// One debit or credit line of a journal entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalItem {
	pub coa_code: String,
	pub debit: Decimal,
	pub credit: Decimal,
}

impl JournalItem {
	pub fn debit(coa_code: impl Into<String>, amount: Decimal) -> Self {
		Self {
			coa_code: coa_code.into(),
			debit: amount,
			credit: Decimal::ZERO,
		}
	}

	pub fn credit(coa_code: impl Into<String>, amount: Decimal) -> Self {
		Self {
			coa_code: coa_code.into(),
			debit: Decimal::ZERO,
			credit: amount,
		}
	}

	/// The same line on the opposite side.
	pub fn swapped(&self) -> Self {
		Self {
			coa_code: self.coa_code.clone(),
			debit: self.credit,
			credit: self.debit,
		}
	}
}

/// An immutable, balanced record of one business event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalEntry {
	pub id: String,
	pub date: DateTime<Utc>,
	pub description: String,
	pub reference_id: String,
	pub reference_type: ReferenceType,
	/// Entry this one reverses, if it is a reversal.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reverses: Option<String>,
	pub items: Vec<JournalItem>,
}

impl JournalEntry {
	pub fn total_debit(&self) -> Decimal {
		self.items.iter().map(|i| i.debit).sum()
	}

	pub fn total_credit(&self) -> Decimal {
		self.items.iter().map(|i| i.credit).sum()
	}

	pub fn is_balanced(&self) -> bool {
		self.total_debit() == self.total_credit()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_balance_delta_direction() {
		let hundred = Decimal::from(100);
		assert_eq!(AccountType::Asset.balance_delta(hundred, Decimal::ZERO), hundred);
		assert_eq!(AccountType::Cogs.balance_delta(Decimal::ZERO, hundred), -hundred);
		assert_eq!(AccountType::Revenue.balance_delta(Decimal::ZERO, hundred), hundred);
		assert_eq!(AccountType::Liability.balance_delta(hundred, Decimal::ZERO), -hundred);
	}

	#[test]
	fn test_mapping_key_round_trips_through_str() {
		for key in [
			MappingKey::PrimaryBank,
			MappingKey::CustomerDeposit,
			MappingKey::PoRevenue,
		] {
			assert_eq!(key.as_str().parse::<MappingKey>().unwrap(), key);
		}
		assert!("BANK".parse::<MappingKey>().is_err());
	}
}
