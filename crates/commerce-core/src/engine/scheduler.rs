//! Periodic job scheduling for the sweeps.
//!
//! Each registered job runs on its own interval. A run that fails, or even
//! panics, is logged and the job keeps its schedule; runs of the same job
//! never overlap and missed ticks are skipped rather than replayed.

use async_trait::async_trait;
use futures::future::BoxFuture;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A unit of periodic work.
pub type Job = Arc<dyn Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

#[derive(Debug, Error)]
pub enum SchedulerError {
	#[error("Scheduler already started")]
	AlreadyStarted,
	#[error("Invalid schedule for job '{0}': interval must be positive")]
	InvalidSchedule(String),
}

/// Runs registered jobs on a fixed cadence until stopped.
#[async_trait]
pub trait Scheduler: Send + Sync {
	/// Adds a job. Jobs can only be registered before `start`.
	async fn register(&self, name: &str, every: Duration, job: Job) -> Result<(), SchedulerError>;

	/// Starts every registered job.
	async fn start(&self) -> Result<(), SchedulerError>;

	/// Stops all jobs, waiting for in-flight runs to finish.
	async fn stop(&self);
}

struct ScheduledJob {
	name: String,
	every: Duration,
	job: Job,
}

/// Tokio interval based scheduler.
pub struct IntervalScheduler {
	jobs: Mutex<Vec<ScheduledJob>>,
	handles: Mutex<Vec<JoinHandle<()>>>,
	started: OnceCell<()>,
	shutdown: watch::Sender<bool>,
}

impl IntervalScheduler {
	pub fn new() -> Self {
		let (shutdown, _) = watch::channel(false);
		Self {
			jobs: Mutex::new(Vec::new()),
			handles: Mutex::new(Vec::new()),
			started: OnceCell::new(),
			shutdown,
		}
	}

	pub fn is_started(&self) -> bool {
		self.started.get().is_some()
	}
}

impl Default for IntervalScheduler {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl Scheduler for IntervalScheduler {
	async fn register(&self, name: &str, every: Duration, job: Job) -> Result<(), SchedulerError> {
		if self.is_started() {
			return Err(SchedulerError::AlreadyStarted);
		}
		if every.is_zero() {
			return Err(SchedulerError::InvalidSchedule(name.to_string()));
		}
		self.jobs.lock().await.push(ScheduledJob {
			name: name.to_string(),
			every,
			job,
		});
		Ok(())
	}

	async fn start(&self) -> Result<(), SchedulerError> {
		self.started.set(()).map_err(|_| SchedulerError::AlreadyStarted)?;

		let jobs = std::mem::take(&mut *self.jobs.lock().await);
		let mut handles = self.handles.lock().await;
		for scheduled in jobs {
			tracing::info!(job = %scheduled.name, every = ?scheduled.every, "Scheduled job");
			handles.push(tokio::spawn(run_job(scheduled, self.shutdown.subscribe())));
		}
		Ok(())
	}

	async fn stop(&self) {
		self.shutdown.send_replace(true);
		let handles = std::mem::take(&mut *self.handles.lock().await);
		for handle in handles {
			if let Err(e) = handle.await {
				tracing::warn!("Scheduler task ended abnormally: {}", e);
			}
		}
	}
}

async fn run_job(scheduled: ScheduledJob, mut shutdown: watch::Receiver<bool>) {
	let mut ticker = tokio::time::interval(scheduled.every);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
	// The first tick completes immediately.
	ticker.tick().await;

	loop {
		tokio::select! {
			_ = ticker.tick() => {
				match tokio::spawn((scheduled.job)()).await {
					Ok(Ok(())) => {
						tracing::debug!(job = %scheduled.name, "Job run finished");
					},
					Ok(Err(e)) => {
						tracing::warn!(job = %scheduled.name, error = %e, "Job run failed");
					},
					Err(e) => {
						tracing::error!(job = %scheduled.name, error = %e, "Job run aborted");
					},
				}
			}
			_ = shutdown.changed() => break,
		}
	}
	tracing::debug!(job = %scheduled.name, "Job stopped");
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	fn counting_job(counter: Arc<AtomicUsize>) -> Job {
		Arc::new(move || {
			let counter = counter.clone();
			Box::pin(async move {
				counter.fetch_add(1, Ordering::SeqCst);
				Ok(())
			})
		})
	}

	#[tokio::test(start_paused = true)]
	async fn test_runs_on_interval_until_stopped() {
		let scheduler = IntervalScheduler::new();
		let runs = Arc::new(AtomicUsize::new(0));
		scheduler
			.register("count", Duration::from_secs(10), counting_job(runs.clone()))
			.await
			.unwrap();
		scheduler.start().await.unwrap();

		tokio::time::sleep(Duration::from_secs(35)).await;
		assert_eq!(runs.load(Ordering::SeqCst), 3);

		scheduler.stop().await;
		tokio::time::sleep(Duration::from_secs(60)).await;
		assert_eq!(runs.load(Ordering::SeqCst), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn test_failing_and_panicking_runs_keep_schedule() {
		let scheduler = IntervalScheduler::new();
		let attempts = Arc::new(AtomicUsize::new(0));
		let counter = attempts.clone();
		let panicking: Job = Arc::new(move || {
			let counter = counter.clone();
			Box::pin(async move {
				if counter.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
					panic!("sweep blew up");
				}
				Err("storage unavailable".to_string())
			})
		});
		let healthy = Arc::new(AtomicUsize::new(0));

		scheduler.register("flaky", Duration::from_secs(5), panicking).await.unwrap();
		scheduler
			.register("healthy", Duration::from_secs(5), counting_job(healthy.clone()))
			.await
			.unwrap();
		scheduler.start().await.unwrap();

		tokio::time::sleep(Duration::from_secs(21)).await;
		assert_eq!(attempts.load(Ordering::SeqCst), 4);
		assert_eq!(healthy.load(Ordering::SeqCst), 4);
		scheduler.stop().await;
	}

	#[tokio::test]
	async fn test_registration_rules() {
		let scheduler = IntervalScheduler::new();
		let runs = Arc::new(AtomicUsize::new(0));
		assert!(matches!(
			scheduler.register("zero", Duration::ZERO, counting_job(runs.clone())).await,
			Err(SchedulerError::InvalidSchedule(_))
		));

		scheduler.start().await.unwrap();
		assert!(matches!(scheduler.start().await, Err(SchedulerError::AlreadyStarted)));
		assert!(matches!(
			scheduler
				.register("late", Duration::from_secs(1), counting_job(runs))
				.await,
			Err(SchedulerError::AlreadyStarted)
		));
		scheduler.stop().await;
	}
}
