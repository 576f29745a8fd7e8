//! Journal lines for the business events the order lifecycle records.
//!
//! Templates address accounts by [`MappingKey`] and resolve them against the
//! chart through an [`AccountMap`], so a shop can renumber its chart without
//! touching the lifecycle.

use crate::LedgerError;
use commerce_types::{ChartOfAccount, JournalItem, MappingKey};
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Mapping key to account code lookup built from the chart.
#[derive(Debug, Clone, Default)]
pub struct AccountMap {
	codes: HashMap<MappingKey, String>,
}

impl AccountMap {
	pub fn from_accounts(accounts: &[ChartOfAccount]) -> Self {
		let codes = accounts
			.iter()
			.filter_map(|account| account.mapping_key.map(|key| (key, account.code.clone())))
			.collect();
		Self { codes }
	}

	pub fn code(&self, key: MappingKey) -> Result<&str, LedgerError> {
		self.codes
			.get(&key)
			.map(String::as_str)
			.ok_or_else(|| LedgerError::UnknownAccount(key.to_string()))
	}
}

/// Standard checkout paid in full: Dr PRIMARY_BANK / Cr SALES_REVENUE.
pub fn sale(map: &AccountMap, amount: Decimal) -> Result<Vec<JournalItem>, LedgerError> {
	Ok(vec![
		JournalItem::debit(map.code(MappingKey::PrimaryBank)?, amount),
		JournalItem::credit(map.code(MappingKey::SalesRevenue)?, amount),
	])
}

/// Pre-order deposit received and held as a liability:
/// Dr PRIMARY_BANK / Cr CUSTOMER_DEPOSIT.
pub fn deposit_received(map: &AccountMap, amount: Decimal) -> Result<Vec<JournalItem>, LedgerError> {
	Ok(vec![
		JournalItem::debit(map.code(MappingKey::PrimaryBank)?, amount),
		JournalItem::credit(map.code(MappingKey::CustomerDeposit)?, amount),
	])
}

/// Pre-order settled: the cash received now plus the deposit held so far
/// become pre-order revenue.
///
/// Dr PRIMARY_BANK (`received`) + Dr CUSTOMER_DEPOSIT (`deposit_applied`) /
/// Cr PO_REVENUE (sum). Zero legs are left out.
pub fn balance_settled(
	map: &AccountMap,
	received: Decimal,
	deposit_applied: Decimal,
) -> Result<Vec<JournalItem>, LedgerError> {
	let mut lines = Vec::with_capacity(3);
	if !received.is_zero() {
		lines.push(JournalItem::debit(map.code(MappingKey::PrimaryBank)?, received));
	}
	if !deposit_applied.is_zero() {
		lines.push(JournalItem::debit(
			map.code(MappingKey::CustomerDeposit)?,
			deposit_applied,
		));
	}
	lines.push(JournalItem::credit(
		map.code(MappingKey::PoRevenue)?,
		received + deposit_applied,
	));
	Ok(lines)
}

/// Unsettled pre-order forfeited: Dr CUSTOMER_DEPOSIT / Cr PO_REVENUE.
pub fn deposit_forfeited(map: &AccountMap, deposit: Decimal) -> Result<Vec<JournalItem>, LedgerError> {
	Ok(vec![
		JournalItem::debit(map.code(MappingKey::CustomerDeposit)?, deposit),
		JournalItem::credit(map.code(MappingKey::PoRevenue)?, deposit),
	])
}

/// Expense paid from the bank: Dr `expense_code` / Cr PRIMARY_BANK.
///
/// Without an explicit code the OPERATING_EXPENSE account is used.
pub fn expense(
	map: &AccountMap,
	expense_code: Option<&str>,
	amount: Decimal,
) -> Result<Vec<JournalItem>, LedgerError> {
	let code = match expense_code {
		Some(code) => code,
		None => map.code(MappingKey::OperatingExpense)?,
	};
	Ok(vec![
		JournalItem::debit(code, amount),
		JournalItem::credit(map.code(MappingKey::PrimaryBank)?, amount),
	])
}

#[cfg(test)]
mod tests {
	use super::*;
	use commerce_types::{AccountType, ChartOfAccount};

	fn account(code: &str, account_type: AccountType, key: Option<MappingKey>) -> ChartOfAccount {
		ChartOfAccount {
			code: code.to_string(),
			name: code.to_string(),
			account_type,
			balance: Decimal::ZERO,
			mapping_key: key,
		}
	}

	fn map() -> AccountMap {
		AccountMap::from_accounts(&[
			account("1002", AccountType::Asset, Some(MappingKey::PrimaryBank)),
			account("2001", AccountType::Liability, Some(MappingKey::CustomerDeposit)),
			account("4002", AccountType::Revenue, Some(MappingKey::PoRevenue)),
		])
	}

	#[test]
	fn test_balance_settled_skips_zero_legs() {
		let lines = balance_settled(&map(), Decimal::from(300), Decimal::ZERO).unwrap();
		assert_eq!(lines.len(), 2);
		assert_eq!(lines[1].credit, Decimal::from(300));

		let lines = balance_settled(&map(), Decimal::from(300), Decimal::from(100)).unwrap();
		assert_eq!(lines.len(), 3);
		assert_eq!(lines[2].coa_code, "4002");
		assert_eq!(lines[2].credit, Decimal::from(400));
	}

	#[test]
	fn test_missing_mapping_is_unknown_account() {
		let err = sale(&map(), Decimal::ONE).unwrap_err();
		assert!(matches!(err, LedgerError::UnknownAccount(key) if key == "SALES_REVENUE"));
	}

	#[test]
	fn test_expense_with_explicit_code() {
		let lines = expense(&map(), Some("6100"), Decimal::from(25)).unwrap();
		assert_eq!(lines[0].coa_code, "6100");
		assert_eq!(lines[1].coa_code, "1002");
	}
}
