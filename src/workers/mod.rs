//! The dispatcher: polls the SS for `PENDING` rows across every resource
//! kind, claims one (`UPDATE ... SET status = 'STARTED' WHERE status =
//! 'PENDING' RETURNING *`), registers its [`crate::taskbus::TaskRegistry`]
//! cancellation token, and spawns the matching worker. Generalizes the
//! teacher's `pipeline::executor::run`/`poll_pending` loop (a single
//! pipeline-kind dispatcher) to every task kind this crate runs (§2 / §5).

pub mod environment_build;
pub mod jupyter_build;
pub mod pipeline_run;

use std::time::Duration;

use tokio::sync::watch;

use crate::controllers::job;
use crate::store::AppState;

/// Runs the dispatcher loop until `shutdown` fires. A single poll tick
/// claims at most one row per resource kind — the production deployment
/// scales by running multiple replicas, each independently polling and
/// racing on the same `WHERE status = 'PENDING'` claim (I1/I4/I5 hold
/// regardless of how many replicas observe the same row).
pub async fn run(state: AppState, poll_interval: Duration, mut shutdown: watch::Receiver<()>) {
    let mut interval = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(err) = poll_once(&state).await {
                    tracing::error!(error = %err, "dispatcher poll failed");
                }
            }
            _ = shutdown.changed() => {
                tracing::info!("dispatcher stopping");
                break;
            }
        }
    }
}

async fn poll_once(state: &AppState) -> anyhow::Result<()> {
    if let Some(build) = environment_build::claim_pending(&state.pool).await? {
        let token = state.tasks.register(build.uuid);
        let state = state.clone();
        tokio::spawn(async move {
            environment_build::run(&state, build, token).await;
        });
    }

    if let Some(build) = jupyter_build::claim_pending(&state.pool).await? {
        let token = state.tasks.register(build.uuid);
        let state = state.clone();
        tokio::spawn(async move {
            jupyter_build::run(&state, build, token).await;
        });
    }

    if let Some(run) = pipeline_run::claim_pending(&state.pool).await? {
        let token = state.tasks.register(run.uuid);
        let state = state.clone();
        tokio::spawn(async move {
            pipeline_run::run(&state, run, token).await;
        });
    }

    for job_uuid in job::list_due(&state.pool).await? {
        if let Err(err) = job::instantiate(state, job_uuid).await {
            tracing::error!(error = %err, %job_uuid, "job instantiation failed");
        }
    }

    Ok(())
}
