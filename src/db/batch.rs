//! Batch execution.
//!
//! [`execute_batch`] runs operations one after another, each with its own
//! checkout, so one failing entry never aborts the rest.
//! [`execute_transaction`] is the all-or-nothing variant: every entry runs on
//! one connection between BEGIN and COMMIT, and the first failure rolls the
//! whole batch back.

use crate::db::pool::{Pool, PooledConnection};
use crate::error::{PoolError, PoolResult};
use crate::models::{BatchOperation, BatchResult, TransactionStatements};
use std::time::Instant;
use tracing::{debug, warn};

fn check_sql(index: usize, operation: &BatchOperation) -> PoolResult<()> {
    if operation.sql.trim().is_empty() {
        return Err(PoolError::validation(format!(
            "batch entry {}: SQL must not be empty",
            index
        )));
    }
    Ok(())
}

/// Run each operation independently and report one result per operation, in order.
pub async fn execute_batch(pool: &Pool, operations: &[BatchOperation]) -> Vec<BatchResult> {
    let mut results = Vec::with_capacity(operations.len());
    for (index, operation) in operations.iter().enumerate() {
        if let Err(e) = check_sql(index, operation) {
            results.push(BatchResult::failure(index, 0, e.to_string()));
            continue;
        }

        let started = Instant::now();
        let result = match pool.execute(&operation.sql, &operation.params).await {
            Ok(done) => BatchResult::success(index, done.affected_rows, done.execution_time_ms),
            Err(e) => {
                debug!(
                    pool_id = %pool.pool_id(),
                    index,
                    error = %e,
                    "Batch entry failed"
                );
                BatchResult::failure(index, started.elapsed().as_millis() as u64, e.to_string())
            }
        };
        results.push(result);
    }

    let failed = results.iter().filter(|r| !r.is_success()).count();
    debug!(
        pool_id = %pool.pool_id(),
        total = results.len(),
        failed,
        "Batch finished"
    );
    results
}

/// Run all operations atomically on one connection.
///
/// Returns the per-operation results on commit. On the first failing entry
/// the transaction is rolled back and `CommandFailed` names that entry.
pub async fn execute_transaction(
    pool: &Pool,
    operations: &[BatchOperation],
) -> PoolResult<Vec<BatchResult>> {
    let statements = pool.backend().transaction_statements().ok_or_else(|| {
        PoolError::validation(format!(
            "{} does not support transactions",
            pool.backend().display_name()
        ))
    })?;
    for (index, operation) in operations.iter().enumerate() {
        check_sql(index, operation)?;
    }

    let conn = pool.acquire().await?;
    let outcome = run_transaction(pool, &conn, statements, operations).await;
    conn.release().await;
    outcome
}

async fn run_transaction(
    pool: &Pool,
    conn: &PooledConnection,
    statements: TransactionStatements,
    operations: &[BatchOperation],
) -> PoolResult<Vec<BatchResult>> {
    conn.execute(statements.begin, &[]).await?;

    let mut results = Vec::with_capacity(operations.len());
    for (index, operation) in operations.iter().enumerate() {
        let started = Instant::now();
        let outcome = conn.execute(&operation.sql, &operation.params).await;
        let elapsed = started.elapsed();
        pool.record_statement(elapsed, outcome.as_ref().err());

        match outcome {
            Ok(affected) => {
                results.push(BatchResult::success(index, affected, elapsed.as_millis() as u64))
            }
            Err(e) => {
                rollback(pool, conn, statements).await;
                return Err(PoolError::command_failed(format!(
                    "transaction rolled back at entry {}: {}",
                    index, e
                )));
            }
        }
    }

    if let Err(e) = conn.execute(statements.commit, &[]).await {
        rollback(pool, conn, statements).await;
        return Err(PoolError::command_failed(format!("commit failed: {}", e)));
    }
    Ok(results)
}

async fn rollback(pool: &Pool, conn: &PooledConnection, statements: TransactionStatements) {
    if let Err(e) = conn.execute(statements.rollback, &[]).await {
        // The connection is released afterwards and validated there
        warn!(
            pool_id = %pool.pool_id(),
            connection_id = %conn.id(),
            error = %e,
            "Rollback failed"
        );
    }
}
