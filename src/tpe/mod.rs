//! Two-Phase Executor: the pattern every controller transition goes
//! through to keep the relational store and the container runtime in
//! sync. Phase one (`transaction`) does all database work inside a
//! single `sqlx` transaction and is committed before anything external
//! happens. Phase two (`collateral`) performs the container-runtime side
//! effect (submit a build, start a container, kill a task) once the
//! database has durably recorded the intent. If collateral fails,
//! `revert` runs in a fresh transaction to put the database back in a
//! consistent (usually `FAILURE`) state — the external side effect is
//! never allowed to leave the database description of it unresolved.

use std::future::Future;
use std::pin::Pin;

use sqlx::{PgPool, Postgres, Transaction};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One step of a two-phase operation. `Out` is whatever the transaction
/// phase needs to hand to the collateral phase (e.g. a freshly assigned
/// task id plus the row's resolved image name).
pub trait TwoPhaseOperation<Out>: Send {
    /// Runs inside the shared transaction. Any `Err` here aborts the
    /// whole batch's transaction — nothing has been committed yet.
    fn transaction<'a>(
        &'a mut self,
        tx: &'a mut Transaction<'_, Postgres>,
    ) -> BoxFuture<'a, anyhow::Result<Out>>;

    /// Runs after the transaction has committed. Failures here trigger
    /// `revert`, they do not roll back the (already-committed) database
    /// state.
    fn collateral<'a>(&'a mut self, out: &'a Out) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Runs in a brand new transaction if `collateral` failed. Default
    /// is a no-op for operations with nothing to undo.
    fn revert<'a>(&'a mut self, pool: &'a PgPool, out: &'a Out) -> BoxFuture<'a, anyhow::Result<()>> {
        let _ = (pool, out);
        Box::pin(async { Ok(()) })
    }
}

/// Runs a single [`TwoPhaseOperation`] to completion: commit the
/// transaction phase, then run collateral, reverting on collateral
/// failure. Returns the transaction phase's output whether or not
/// collateral succeeded, alongside the collateral result.
pub async fn execute<Out, Op>(pool: &PgPool, mut op: Op) -> anyhow::Result<(Out, anyhow::Result<()>)>
where
    Op: TwoPhaseOperation<Out>,
    Out: Send,
{
    let mut tx = pool.begin().await?;
    let out = op.transaction(&mut tx).await?;
    tx.commit().await?;

    let collateral_result = op.collateral(&out).await;
    if let Err(err) = &collateral_result {
        tracing::warn!(error = %err, "collateral phase failed, reverting");
        if let Err(revert_err) = op.revert(pool, &out).await {
            tracing::error!(error = %revert_err, "revert phase also failed");
        }
    }

    Ok((out, collateral_result))
}

/// Runs a batch of independent two-phase operations. Each operation's
/// transaction phase is committed (or aborted) independently of the
/// others — one row's conflict never blocks the rest of the batch. The
/// per-operation collateral failures are reported back per item rather
/// than failing the whole batch, matching the "full success (201) vs.
/// partial failure (500 with a failed list)" shape of the build-creation
/// endpoints (§4.2.1).
pub async fn execute_batch<Out, Op>(
    pool: &PgPool,
    ops: Vec<Op>,
) -> Vec<anyhow::Result<(Out, anyhow::Result<()>)>>
where
    Op: TwoPhaseOperation<Out>,
    Out: Send,
{
    let mut results = Vec::with_capacity(ops.len());
    for op in ops {
        results.push(execute(pool, op).await);
    }
    results
}

/// Closure-shaped convenience wrapper around the same contract as
/// [`execute`], for call sites where defining a one-off
/// [`TwoPhaseOperation`] impl would be pure ceremony: a single
/// controller transition with one transaction closure and one
/// collateral closure. `revert` defaults to a no-op unless supplied via
/// [`run_with_revert`].
pub async fn run<Out, Tx, Col, ColFut>(
    pool: &PgPool,
    transaction: Tx,
    collateral: Col,
) -> anyhow::Result<(Out, anyhow::Result<()>)>
where
    Out: Send,
    Tx: for<'a> FnOnce(&'a mut Transaction<'_, Postgres>) -> BoxFuture<'a, anyhow::Result<Out>>,
    Col: FnOnce(&Out) -> ColFut,
    ColFut: Future<Output = anyhow::Result<()>>,
{
    let mut tx = pool.begin().await?;
    let out = transaction(&mut tx).await?;
    tx.commit().await?;

    let collateral_result = collateral(&out).await;
    if let Err(err) = &collateral_result {
        tracing::warn!(error = %err, "collateral phase failed (no revert registered)");
    }

    Ok((out, collateral_result))
}

/// Like [`run`], but with an explicit revert closure invoked in a fresh
/// transaction when collateral fails.
pub async fn run_with_revert<Out, Tx, Col, ColFut, Rev, RevFut>(
    pool: &PgPool,
    transaction: Tx,
    collateral: Col,
    revert: Rev,
) -> anyhow::Result<(Out, anyhow::Result<()>)>
where
    Out: Send,
    Tx: for<'a> FnOnce(&'a mut Transaction<'_, Postgres>) -> BoxFuture<'a, anyhow::Result<Out>>,
    Col: FnOnce(&Out) -> ColFut,
    ColFut: Future<Output = anyhow::Result<()>>,
    Rev: for<'a> FnOnce(&'a PgPool, &'a Out) -> BoxFuture<'a, anyhow::Result<()>>,
{
    let mut tx = pool.begin().await?;
    let out = transaction(&mut tx).await?;
    tx.commit().await?;

    let collateral_result = collateral(&out).await;
    if let Err(err) = &collateral_result {
        tracing::warn!(error = %err, "collateral phase failed, reverting");
        if let Err(revert_err) = revert(pool, &out).await {
            tracing::error!(error = %revert_err, "revert phase also failed");
        }
    }

    Ok((out, collateral_result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct RecordingOp {
        collateral_calls: Arc<AtomicUsize>,
        revert_calls: Arc<AtomicUsize>,
        fail_collateral: bool,
    }

    impl TwoPhaseOperation<u32> for RecordingOp {
        fn transaction<'a>(
            &'a mut self,
            _tx: &'a mut Transaction<'_, Postgres>,
        ) -> BoxFuture<'a, anyhow::Result<u32>> {
            Box::pin(async { Ok(42) })
        }

        fn collateral<'a>(&'a mut self, out: &'a u32) -> BoxFuture<'a, anyhow::Result<()>> {
            let fail = self.fail_collateral;
            let calls = self.collateral_calls.clone();
            let out = *out;
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if fail {
                    anyhow::bail!("collateral failed for {out}");
                }
                Ok(())
            })
        }

        fn revert<'a>(
            &'a mut self,
            _pool: &'a PgPool,
            _out: &'a u32,
        ) -> BoxFuture<'a, anyhow::Result<()>> {
            let calls = self.revert_calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[test]
    fn default_revert_is_a_noop() {
        struct NoRevertOp;
        impl TwoPhaseOperation<()> for NoRevertOp {
            fn transaction<'a>(
                &'a mut self,
                _tx: &'a mut Transaction<'_, Postgres>,
            ) -> BoxFuture<'a, anyhow::Result<()>> {
                Box::pin(async { Ok(()) })
            }

            fn collateral<'a>(&'a mut self, _out: &'a ()) -> BoxFuture<'a, anyhow::Result<()>> {
                Box::pin(async { Ok(()) })
            }
        }
        // Compiles without overriding revert — that's the behavior under test.
        let _ = NoRevertOp;
    }

    #[tokio::test]
    async fn collateral_failure_is_reported_without_panicking() {
        // Exercises collateral() directly: a real `Transaction` needs a live
        // pool, so the full commit -> collateral -> revert wiring is covered
        // by the `#[sqlx::test]` integration suite instead.
        let collateral_calls = Arc::new(AtomicUsize::new(0));
        let revert_calls = Arc::new(AtomicUsize::new(0));
        let mut op = RecordingOp {
            collateral_calls: collateral_calls.clone(),
            revert_calls,
            fail_collateral: true,
        };
        let out = 1u32;
        assert!(op.collateral(&out).await.is_err());
        assert_eq!(collateral_calls.load(Ordering::SeqCst), 1);
    }
}
