//! Main entry point for the commerce service.
//!
//! Runs the transactional core as a long-lived service (sweeps on their
//! intervals, notifications dispatched as events commit) or performs a single
//! sweep or trial balance for use from an external scheduler.

use clap::{Parser, Subcommand, ValueEnum};
use commerce_config::Config;
use commerce_core::CommerceEngine;
use std::path::PathBuf;

mod factory_registry;

/// Command-line arguments for the commerce service.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// Path to configuration file
	#[arg(short, long, env = "COMMERCE_CONFIG", default_value = "config/commerce.toml")]
	config: PathBuf,

	/// Log level (trace, debug, info, warn, error)
	#[arg(short, long, default_value = "info")]
	log_level: String,

	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum Command {
	/// Run the engine until interrupted (default)
	Run,
	/// Run one sweep now and exit
	Sweep {
		#[arg(value_enum)]
		target: SweepTarget,
	},
	/// Print the trial balance and exit
	TrialBalance,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq)]
enum SweepTarget {
	/// Expire lapsed checkouts and overdue reservations
	Reservations,
	/// Forfeit pre-orders past their deposit deadline
	Deposits,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	// Initialize tracing with env filter
	use tracing_subscriber::{fmt, EnvFilter};

	let default_directive = args.log_level.to_string();
	let env_filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

	fmt()
		.with_env_filter(env_filter)
		.with_thread_ids(true)
		.with_target(true)
		.init();

	let config_path = args
		.config
		.to_str()
		.ok_or("Configuration path is not valid UTF-8")?;
	let config = Config::from_file(config_path).await?;
	tracing::info!("Loaded configuration [{}]", config.shop.id);

	let engine = factory_registry::build_engine_from_config(config).await?;
	engine.initialize().await?;

	match args.command.unwrap_or(Command::Run) {
		Command::Run => {
			tracing::info!("Started commerce engine");
			engine.run().await?;
			tracing::info!("Stopped commerce engine");
		},
		Command::Sweep { target } => sweep_once(&engine, target).await?,
		Command::TrialBalance => print_trial_balance(&engine).await?,
	}

	Ok(())
}

/// Runs one sweep, as an external cron would.
async fn sweep_once(engine: &CommerceEngine, target: SweepTarget) -> Result<(), Box<dyn std::error::Error>> {
	let now = chrono::Utc::now();
	let summary = match target {
		SweepTarget::Reservations => {
			let sweep = engine.sweep_reservations(now).await?;
			serde_json::json!({
				"cancelled_checkouts": sweep.cancelled_checkouts,
				"expired_reservations": sweep.expired_reservations,
			})
		},
		SweepTarget::Deposits => {
			let report = engine.forfeit_overdue(now).await?;
			serde_json::json!({
				"forfeited": report.forfeited,
				"failed": report.failed,
			})
		},
	};
	println!("{}", serde_json::to_string_pretty(&summary)?);
	Ok(())
}

async fn print_trial_balance(engine: &CommerceEngine) -> Result<(), Box<dyn std::error::Error>> {
	let trial_balance = engine.ledger().trial_balance().await?;
	let accounts: Vec<_> = trial_balance
		.accounts
		.iter()
		.map(|account| {
			serde_json::json!({
				"code": account.code,
				"name": account.name,
				"type": account.account_type,
				"balance": account.balance,
			})
		})
		.collect();
	let summary = serde_json::json!({
		"debit_normal_total": trial_balance.debit_normal_total,
		"credit_normal_total": trial_balance.credit_normal_total,
		"balanced": trial_balance.is_balanced(),
		"accounts": accounts,
	});
	println!("{}", serde_json::to_string_pretty(&summary)?);

	if !trial_balance.is_balanced() {
		return Err("Trial balance does not hold".into());
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	#[test]
	fn test_args_default_values() {
		let args = Args::try_parse_from(["commerce"]).unwrap();
		assert_eq!(args.config, PathBuf::from("config/commerce.toml"));
		assert_eq!(args.log_level, "info");
		assert_eq!(args.command, None);
	}

	#[test]
	fn test_sweep_subcommand() {
		let args = Args::try_parse_from(["commerce", "-c", "shop.toml", "sweep", "deposits"]).unwrap();
		assert_eq!(args.config, PathBuf::from("shop.toml"));
		assert_eq!(
			args.command,
			Some(Command::Sweep {
				target: SweepTarget::Deposits
			})
		);
		assert!(Args::try_parse_from(["commerce", "sweep", "everything"]).is_err());
	}

	#[tokio::test]
	async fn test_one_shot_commands_with_file_config() {
		let temp_dir = tempdir().unwrap();
		let storage_path = temp_dir.path().join("storage");
		let config_path = temp_dir.path().join("commerce.toml");
		let config_content = format!(
			r#"
[shop]
id = "test-file-shop"

[storage]
primary = "file"

[storage.implementations.file]
storage_path = "{}"
"#,
			storage_path.display()
		);
		std::fs::write(&config_path, config_content).unwrap();

		let config = Config::from_file(config_path.to_str().unwrap()).await.unwrap();
		assert_eq!(config.shop.id, "test-file-shop");

		let engine = factory_registry::build_engine_from_config(config).await.unwrap();
		sweep_once(&engine, SweepTarget::Reservations).await.unwrap();
		sweep_once(&engine, SweepTarget::Deposits).await.unwrap();
		print_trial_balance(&engine).await.unwrap();
	}
}
