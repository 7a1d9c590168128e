//! Recurring Scheduler: drives named periodic jobs at-most-once per
//! interval across any number of replicas, cooperating purely through a
//! row-level lock on the `scheduler_jobs` table (§4.5, I7, P5).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::watch;

/// `ε` in §4.5: a small positive constant, smaller than every registered
/// job's interval, that accounts for clock/scheduling jitter between the
/// wheel's wakeup and the row becoming due.
const EPSILON_MINUTES: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerJobType {
    TelemetryHeartbeat,
    OrchestExamples,
}

impl SchedulerJobType {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::TelemetryHeartbeat => "TELEMETRY_HEARTBEAT",
            Self::OrchestExamples => "ORCHEST_EXAMPLES",
        }
    }
}

/// A recurring job's side effect. Production handlers in this crate are
/// intentionally thin — the telemetry payload and the examples-JSON
/// fetch are out-of-scope external collaborators (§1); what's under
/// test is the exactly-once-per-interval dispatch mechanism around them.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self) -> anyhow::Result<()>;
}

pub struct TelemetryHeartbeatHandler;

#[async_trait]
impl JobHandler for TelemetryHeartbeatHandler {
    async fn run(&self) -> anyhow::Result<()> {
        tracing::info!("telemetry heartbeat signal");
        Ok(())
    }
}

pub struct OrchestExamplesHandler;

#[async_trait]
impl JobHandler for OrchestExamplesHandler {
    async fn run(&self) -> anyhow::Result<()> {
        tracing::info!("polled orchest examples manifest");
        Ok(())
    }
}

struct RegisteredJob {
    job_type: SchedulerJobType,
    interval_minutes: f64,
    handler: Arc<dyn JobHandler>,
}

pub struct RecurringScheduler {
    pool: PgPool,
    jobs: Vec<RegisteredJob>,
}

impl RecurringScheduler {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            jobs: Vec::new(),
        }
    }

    pub fn register(
        &mut self,
        job_type: SchedulerJobType,
        interval_minutes: f64,
        handler: Arc<dyn JobHandler>,
    ) {
        assert!(
            EPSILON_MINUTES < interval_minutes,
            "epsilon must be smaller than every job's interval"
        );
        self.jobs.push(RegisteredJob {
            job_type,
            interval_minutes,
            handler,
        });
    }

    pub fn register_defaults(&mut self, config: &crate::config::Config) {
        self.register(
            SchedulerJobType::TelemetryHeartbeat,
            config.telemetry_interval_minutes as f64,
            Arc::new(TelemetryHeartbeatHandler),
        );
        self.register(
            SchedulerJobType::OrchestExamples,
            config.examples_poll_interval_minutes as f64,
            Arc::new(OrchestExamplesHandler),
        );
    }

    /// Runs the wheel until `shutdown` fires. Each registered job gets
    /// its own tick loop so a slow handler never delays another job's
    /// cadence.
    pub async fn run(self, mut shutdown: watch::Receiver<()>) {
        let mut handles = Vec::new();
        for job in self.jobs {
            let pool = self.pool.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_secs_f64(job.interval_minutes * 60.0));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(err) = run_tick(&pool, job.job_type, job.interval_minutes, job.handler.as_ref()).await {
                                tracing::error!(error = %err, job = job.job_type.as_db_str(), "scheduler tick failed");
                            }
                        }
                        _ = shutdown.changed() => {
                            tracing::info!(job = job.job_type.as_db_str(), "scheduler job stopping");
                            break;
                        }
                    }
                }
            }));
        }

        let _ = shutdown.changed().await;
        for handle in handles {
            handle.abort();
        }
    }
}

/// One tick of §4.5's protocol: claim the row if due, then run the
/// handler iff the claim succeeded.
async fn run_tick(
    pool: &PgPool,
    job_type: SchedulerJobType,
    interval_minutes: f64,
    handler: &dyn JobHandler,
) -> anyhow::Result<()> {
    let run_collateral = claim_due_job(pool, job_type, interval_minutes).await?;
    if run_collateral {
        if let Err(err) = handler.run().await {
            tracing::error!(error = %err, job = job_type.as_db_str(), "scheduler handler failed");
        }
    }
    Ok(())
}

async fn claim_due_job(
    pool: &PgPool,
    job_type: SchedulerJobType,
    interval_minutes: f64,
) -> anyhow::Result<bool> {
    let mut tx = pool.begin().await?;
    let now = Utc::now();
    let due_before = now
        - chrono::Duration::milliseconds(
            ((interval_minutes - EPSILON_MINUTES) * 60_000.0) as i64,
        );

    let row = sqlx::query!(
        r#"
        SELECT type FROM scheduler_jobs
        WHERE type = $1 AND timestamp <= $2
        FOR UPDATE
        "#,
        job_type.as_db_str(),
        due_before,
    )
    .fetch_optional(&mut *tx)
    .await?;

    let run_collateral = row.is_some();
    if run_collateral {
        sqlx::query!(
            "UPDATE scheduler_jobs SET timestamp = $1 WHERE type = $2",
            now,
            job_type.as_db_str(),
        )
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(run_collateral)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "epsilon must be smaller")]
    fn register_rejects_an_interval_not_exceeding_epsilon() {
        let pool = sqlx::PgPool::connect_lazy("postgres://localhost/does-not-matter")
            .expect("lazy pool never touches the network");
        let mut scheduler = RecurringScheduler::new(pool);
        scheduler.register(
            SchedulerJobType::TelemetryHeartbeat,
            EPSILON_MINUTES,
            Arc::new(TelemetryHeartbeatHandler),
        );
    }

    #[test]
    fn job_types_map_to_their_documented_db_strings() {
        assert_eq!(SchedulerJobType::TelemetryHeartbeat.as_db_str(), "TELEMETRY_HEARTBEAT");
        assert_eq!(SchedulerJobType::OrchestExamples.as_db_str(), "ORCHEST_EXAMPLES");
    }

    /// P5: N "replicas" racing `claim_due_job` on the same due row, via
    /// `FOR UPDATE`, produce exactly one winner regardless of N.
    #[sqlx::test(migrations = "./migrations")]
    async fn only_one_of_many_concurrent_replicas_claims_the_due_job(pool: sqlx::PgPool) {
        const REPLICAS: usize = 8;
        let handles: Vec<_> = (0..REPLICAS)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    claim_due_job(&pool, SchedulerJobType::TelemetryHeartbeat, 60.0)
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut claims = 0;
        for handle in handles {
            if handle.await.unwrap() {
                claims += 1;
            }
        }

        assert_eq!(claims, 1);
    }
}
