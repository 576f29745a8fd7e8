//! Double-entry ledger poster.
//!
//! The only writer of chart-of-accounts balances. A posting is validated in
//! full before anything is staged: lines must be one-sided and non-negative,
//! debits must equal credits and every account must exist. The entry is
//! stored create-only together with the updated balances in one atomic batch,
//! under the locks of the accounts it touches.

use chrono::{DateTime, Utc};
use commerce_storage::{LockDomain, StorageError, StorageService, Transaction};
use commerce_types::{
	truncate_id, AccountSeed, ChartOfAccount, Clock, JournalEntry, JournalItem, MappingKey,
	ReferenceType, StorageKey,
};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

pub mod postings;

pub use postings::AccountMap;

/// Errors that can occur while posting or querying the ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
	#[error("Unbalanced entry: debits {debit} != credits {credit}")]
	Unbalanced { debit: Decimal, credit: Decimal },
	#[error("Unknown account: {0}")]
	UnknownAccount(String),
	#[error("Invalid journal line: {0}")]
	InvalidLine(String),
	#[error("Journal entry has no lines")]
	EmptyEntry,
	#[error("Not found: {0}")]
	NotFound(String),
	#[error("Journal entry {0} was already reversed")]
	AlreadyReversed(String),
	#[error("Duplicate account: {0}")]
	DuplicateAccount(String),
	#[error("Conflict: {0}")]
	Conflict(String),
	#[error("Storage error: {0}")]
	Storage(String),
}

impl LedgerError {
	/// Whether retrying the operation may succeed.
	pub fn is_conflict(&self) -> bool {
		matches!(self, LedgerError::Conflict(_))
	}
}

impl From<StorageError> for LedgerError {
	fn from(err: StorageError) -> Self {
		match err {
			StorageError::AlreadyExists(key) => LedgerError::Conflict(key),
			other => LedgerError::Storage(other.to_string()),
		}
	}
}

/// Totals of the chart split by normal balance side.
#[derive(Debug, Clone)]
pub struct TrialBalance {
	/// Sum of ASSET, EXPENSE and COGS balances.
	pub debit_normal_total: Decimal,
	/// Sum of LIABILITY, EQUITY and REVENUE balances.
	pub credit_normal_total: Decimal,
	pub accounts: Vec<ChartOfAccount>,
}

impl TrialBalance {
	/// The accounting identity holds.
	pub fn is_balanced(&self) -> bool {
		self.debit_normal_total == self.credit_normal_total
	}
}

/// An account whose stored balance disagrees with its journal.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceDrift {
	pub code: String,
	pub recorded: Decimal,
	pub computed: Decimal,
}

/// Id of the entry reversing `entry_id`. Fixed per entry, so the create-only
/// write rejects a second reversal.
fn reversal_id(entry_id: &str) -> String {
	format!("{}-rev", entry_id)
}

pub struct LedgerService {
	storage: Arc<StorageService>,
	clock: Arc<dyn Clock>,
}

impl LedgerService {
	pub fn new(storage: Arc<StorageService>, clock: Arc<dyn Clock>) -> Self {
		Self { storage, clock }
	}

	/// Adds an account to the chart with a zero balance.
	pub async fn open_account(&self, seed: &AccountSeed) -> Result<ChartOfAccount, LedgerError> {
		if seed.code.is_empty() {
			return Err(LedgerError::InvalidLine("account code cannot be empty".into()));
		}

		let mut tx = self.storage.begin();
		tx.lock(LockDomain::Account, [seed.code.as_str()]).await;

		if tx
			.find::<ChartOfAccount>(StorageKey::Accounts.as_str(), &seed.code)
			.await?
			.is_some()
		{
			return Err(LedgerError::DuplicateAccount(seed.code.clone()));
		}
		if let Some(key) = seed.mapping_key {
			if let Some(holder) = self.accounts().await?.into_iter().find(|a| a.mapping_key == Some(key)) {
				return Err(LedgerError::DuplicateAccount(format!(
					"{} is already mapped to {}",
					key, holder.code
				)));
			}
		}

		let account = ChartOfAccount {
			code: seed.code.clone(),
			name: seed.name.clone(),
			account_type: seed.account_type,
			balance: Decimal::ZERO,
			mapping_key: seed.mapping_key,
		};
		tx.insert(StorageKey::Accounts.as_str(), &account.code, &account)?;
		tx.commit().await?;

		tracing::info!(code = %account.code, account_type = %account.account_type, "Account opened");
		Ok(account)
	}

	/// Opens every seed whose code is not in the chart yet. Returns how many
	/// accounts were opened.
	pub async fn seed_chart(&self, seeds: &[AccountSeed]) -> Result<usize, LedgerError> {
		let mut opened = 0;
		for seed in seeds {
			match self.open_account(seed).await {
				Ok(_) => opened += 1,
				Err(LedgerError::DuplicateAccount(_)) => {
					tracing::debug!(code = %seed.code, "Account already present");
				},
				Err(e) => return Err(e),
			}
		}
		Ok(opened)
	}

	pub async fn account(&self, code: &str) -> Result<ChartOfAccount, LedgerError> {
		self.storage
			.find(StorageKey::Accounts.as_str(), code)
			.await?
			.ok_or_else(|| LedgerError::UnknownAccount(code.to_string()))
	}

	pub async fn account_for(&self, key: MappingKey) -> Result<ChartOfAccount, LedgerError> {
		self.accounts()
			.await?
			.into_iter()
			.find(|a| a.mapping_key == Some(key))
			.ok_or_else(|| LedgerError::UnknownAccount(key.to_string()))
	}

	/// The chart, ordered by code.
	pub async fn accounts(&self) -> Result<Vec<ChartOfAccount>, LedgerError> {
		let mut accounts: Vec<ChartOfAccount> =
			self.storage.list(StorageKey::Accounts.as_str()).await?;
		accounts.sort_by(|a, b| a.code.cmp(&b.code));
		Ok(accounts)
	}

	pub async fn account_map(&self) -> Result<AccountMap, LedgerError> {
		Ok(AccountMap::from_accounts(&self.accounts().await?))
	}

	pub async fn entry(&self, id: &str) -> Result<JournalEntry, LedgerError> {
		self.storage
			.find(StorageKey::JournalEntries.as_str(), id)
			.await?
			.ok_or_else(|| LedgerError::NotFound(format!("journal entry {}", id)))
	}

	/// Every entry, oldest first.
	pub async fn entries(&self) -> Result<Vec<JournalEntry>, LedgerError> {
		let mut entries: Vec<JournalEntry> =
			self.storage.list(StorageKey::JournalEntries.as_str()).await?;
		entries.sort_by(|a, b| a.date.cmp(&b.date).then(a.id.cmp(&b.id)));
		Ok(entries)
	}

	pub async fn entries_for(&self, reference_id: &str) -> Result<Vec<JournalEntry>, LedgerError> {
		Ok(self
			.entries()
			.await?
			.into_iter()
			.filter(|e| e.reference_id == reference_id)
			.collect())
	}

	/// Records a balanced entry and applies it to the chart. Returns the
	/// entry id.
	pub async fn post(
		&self,
		description: &str,
		reference_id: &str,
		reference_type: ReferenceType,
		lines: Vec<JournalItem>,
	) -> Result<String, LedgerError> {
		let mut tx = self.storage.begin();
		let entry = self
			.post_in(&mut tx, description, reference_id, reference_type, lines)
			.await?;
		tx.commit().await?;
		Ok(entry.id)
	}

	/// Stages an entry and its balance updates into `tx`.
	pub async fn post_in(
		&self,
		tx: &mut Transaction<'_>,
		description: &str,
		reference_id: &str,
		reference_type: ReferenceType,
		lines: Vec<JournalItem>,
	) -> Result<JournalEntry, LedgerError> {
		let entry = JournalEntry {
			id: uuid::Uuid::new_v4().to_string(),
			date: self.clock.now(),
			description: description.to_string(),
			reference_id: reference_id.to_string(),
			reference_type,
			reverses: None,
			items: lines,
		};
		self.stage_entry(tx, entry).await
	}

	/// Posts the mirror image of an entry. Returns the reversal's id.
	pub async fn reverse(&self, entry_id: &str, description: &str) -> Result<String, LedgerError> {
		let mut tx = self.storage.begin();
		let entry = self.reverse_in(&mut tx, entry_id, description).await?;
		tx.commit().await.map_err(|e| match e {
			StorageError::AlreadyExists(_) => LedgerError::AlreadyReversed(entry_id.to_string()),
			other => other.into(),
		})?;
		Ok(entry.id)
	}

	pub async fn reverse_in(
		&self,
		tx: &mut Transaction<'_>,
		entry_id: &str,
		description: &str,
	) -> Result<JournalEntry, LedgerError> {
		let original: JournalEntry = tx
			.find(StorageKey::JournalEntries.as_str(), entry_id)
			.await?
			.ok_or_else(|| LedgerError::NotFound(format!("journal entry {}", entry_id)))?;

		let id = reversal_id(entry_id);
		if tx
			.find::<JournalEntry>(StorageKey::JournalEntries.as_str(), &id)
			.await?
			.is_some()
		{
			return Err(LedgerError::AlreadyReversed(entry_id.to_string()));
		}

		let reversal = JournalEntry {
			id,
			date: self.clock.now(),
			description: description.to_string(),
			reference_id: original.reference_id.clone(),
			reference_type: ReferenceType::Reversal,
			reverses: Some(original.id.clone()),
			items: original.items.iter().map(JournalItem::swapped).collect(),
		};
		self.stage_entry(tx, reversal).await
	}

	/// Reverses several entries inside one transaction.
	///
	/// The accounts of every entry are locked in one call before anything is
	/// staged, so the account locks are taken in a single ascending pass.
	pub async fn reverse_all_in(
		&self,
		tx: &mut Transaction<'_>,
		entry_ids: &[String],
		description: &str,
	) -> Result<Vec<JournalEntry>, LedgerError> {
		let mut codes = BTreeSet::new();
		for entry_id in entry_ids {
			let original: JournalEntry = tx
				.find(StorageKey::JournalEntries.as_str(), entry_id)
				.await?
				.ok_or_else(|| LedgerError::NotFound(format!("journal entry {}", entry_id)))?;
			codes.extend(original.items.into_iter().map(|item| item.coa_code));
		}
		tx.lock(LockDomain::Account, codes).await;

		let mut reversals = Vec::with_capacity(entry_ids.len());
		for entry_id in entry_ids {
			reversals.push(self.reverse_in(tx, entry_id, description).await?);
		}
		Ok(reversals)
	}

	async fn stage_entry(
		&self,
		tx: &mut Transaction<'_>,
		entry: JournalEntry,
	) -> Result<JournalEntry, LedgerError> {
		if let Err(e) = validate_lines(&entry.items) {
			tracing::error!(reference_id = %truncate_id(&entry.reference_id), error = %e, "Rejected journal entry");
			return Err(e);
		}

		// Ascending code order comes from the lock manager.
		let codes: Vec<&str> = entry.items.iter().map(|i| i.coa_code.as_str()).collect();
		tx.lock(LockDomain::Account, codes).await;

		let mut touched: BTreeMap<String, ChartOfAccount> = BTreeMap::new();
		for item in &entry.items {
			if touched.contains_key(&item.coa_code) {
				continue;
			}
			match tx
				.find::<ChartOfAccount>(StorageKey::Accounts.as_str(), &item.coa_code)
				.await?
			{
				Some(account) => {
					touched.insert(item.coa_code.clone(), account);
				},
				None => {
					tracing::error!(code = %item.coa_code, "Posting to unknown account");
					return Err(LedgerError::UnknownAccount(item.coa_code.clone()));
				},
			}
		}

		for item in &entry.items {
			if let Some(account) = touched.get_mut(&item.coa_code) {
				account.balance += account.account_type.balance_delta(item.debit, item.credit);
			}
		}

		for account in touched.values() {
			tx.put(StorageKey::Accounts.as_str(), &account.code, account)?;
		}
		tx.insert(StorageKey::JournalEntries.as_str(), &entry.id, &entry)?;

		tracing::info!(
			entry_id = %truncate_id(&entry.id),
			reference_id = %truncate_id(&entry.reference_id),
			reference_type = %entry.reference_type,
			amount = %entry.total_debit(),
			"Journal entry staged"
		);
		Ok(entry)
	}

	/// Sums the chart by normal balance side.
	pub async fn trial_balance(&self) -> Result<TrialBalance, LedgerError> {
		let accounts = self.accounts().await?;
		let (mut debit_normal_total, mut credit_normal_total) = (Decimal::ZERO, Decimal::ZERO);
		for account in &accounts {
			if account.account_type.is_debit_normal() {
				debit_normal_total += account.balance;
			} else {
				credit_normal_total += account.balance;
			}
		}
		Ok(TrialBalance {
			debit_normal_total,
			credit_normal_total,
			accounts,
		})
	}

	/// Replays the journal and reports accounts whose stored balance differs.
	pub async fn verify(&self) -> Result<Vec<BalanceDrift>, LedgerError> {
		let accounts = self.accounts().await?;
		let types: HashMap<&str, _> = accounts
			.iter()
			.map(|a| (a.code.as_str(), a.account_type))
			.collect();

		let mut computed: HashMap<String, Decimal> = HashMap::new();
		for entry in self.entries().await? {
			for item in &entry.items {
				let Some(account_type) = types.get(item.coa_code.as_str()) else {
					tracing::warn!(
						entry_id = %truncate_id(&entry.id),
						code = %item.coa_code,
						"Journal references a missing account"
					);
					continue;
				};
				*computed.entry(item.coa_code.clone()).or_default() +=
					account_type.balance_delta(item.debit, item.credit);
			}
		}

		Ok(accounts
			.into_iter()
			.filter_map(|account| {
				let expected = computed.get(&account.code).copied().unwrap_or(Decimal::ZERO);
				(expected != account.balance).then(|| BalanceDrift {
					code: account.code,
					recorded: account.balance,
					computed: expected,
				})
			})
			.collect())
	}

	pub fn now(&self) -> DateTime<Utc> {
		self.clock.now()
	}
}

fn validate_lines(lines: &[JournalItem]) -> Result<(), LedgerError> {
	if lines.is_empty() {
		return Err(LedgerError::EmptyEntry);
	}

	let (mut debit, mut credit) = (Decimal::ZERO, Decimal::ZERO);
	for line in lines {
		if line.debit.is_sign_negative() || line.credit.is_sign_negative() {
			return Err(LedgerError::InvalidLine(format!(
				"negative amount on account {}",
				line.coa_code
			)));
		}
		if line.debit.is_zero() == line.credit.is_zero() {
			return Err(LedgerError::InvalidLine(format!(
				"account {} needs exactly one of debit or credit",
				line.coa_code
			)));
		}
		debit += line.debit;
		credit += line.credit;
	}

	if debit != credit {
		return Err(LedgerError::Unbalanced { debit, credit });
	}
	Ok(())
}
