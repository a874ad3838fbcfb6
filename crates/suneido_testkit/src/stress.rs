//! Stress runs for concurrent transactions.
//!
//! These runs drive many update transactions from several threads against
//! one table and count commits, conflicts and other failures.

use crossbeam::channel;
use std::thread;
use std::time::{Duration, Instant};
use suneido_core::{CoreError, Database, RecordBuilder};
use tracing::debug;

/// Table written by the stress runs.
pub const STRESS_TABLE: &str = "stress";

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total transactions attempted.
    pub total_ops: usize,
    /// Transactions that committed.
    pub successful_ops: usize,
    /// Transactions rejected with a conflict.
    pub conflicts: usize,
    /// Transactions that failed for any other reason.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Transactions per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, conflicts: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + conflicts + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            conflicts,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {name} ===");
        println!("Transactions: {}", self.total_ops);
        println!("Committed: {}", self.successful_ops);
        println!("Conflicts: {}", self.conflicts);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} tx/sec", self.ops_per_second);
    }
}

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of concurrent threads.
    pub threads: usize,
    /// Transactions per thread.
    pub transactions: usize,
    /// Rows inserted by each transaction.
    pub rows_per_transaction: usize,
    /// Keys are drawn from `0..key_space`; a small space forces collisions.
    pub key_space: i64,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            transactions: 50,
            rows_per_transaction: 4,
            key_space: 1_000_000,
        }
    }
}

/// Creates the stress table: `(k,thread) key(k) index(thread)`.
///
/// # Panics
///
/// Panics if the table cannot be created.
pub fn create_stress_table(db: &Database) {
    db.transaction(|t| t.create_table(STRESS_TABLE, "(k,thread) key(k) index(thread)").map(|_| ()))
        .expect("Failed to create stress table");
}

fn key_for(thread: usize, tx: usize, row: usize, config: &StressConfig) -> i64 {
    let n = (thread * 7919 + tx * 104_729 + row * 31) as i64;
    n.rem_euclid(config.key_space)
}

/// Runs concurrent inserting transactions against [`STRESS_TABLE`].
///
/// Each committed transaction adds exactly `rows_per_transaction` rows, so
/// the final row count is `successful_ops * rows_per_transaction`.
pub fn stress_concurrent_inserts(db: &Database, config: &StressConfig) -> StressTestResult {
    let (tx_results, rx_results) = channel::unbounded();
    let start = Instant::now();

    thread::scope(|s| {
        for th in 0..config.threads {
            let results = tx_results.clone();
            s.spawn(move || {
                for i in 0..config.transactions {
                    let outcome = db.transaction(|t| {
                        for r in 0..config.rows_per_transaction {
                            let rec = RecordBuilder::new()
                                .int(key_for(th, i, r, config))
                                .int(th as i64)
                                .build();
                            t.add_record(STRESS_TABLE, rec)?;
                        }
                        Ok(())
                    });
                    let _ = results.send(outcome);
                }
            });
        }
    });
    drop(tx_results);

    let (mut ok, mut conflicts, mut failed) = (0, 0, 0);
    for outcome in rx_results {
        match outcome {
            Ok(()) => ok += 1,
            Err(CoreError::Conflict { .. }) => conflicts += 1,
            Err(e) => {
                debug!(error = %e, "stress transaction failed");
                failed += 1;
            }
        }
    }
    StressTestResult::new(ok, conflicts, failed, start.elapsed())
}

/// Runs readers alongside [`stress_concurrent_inserts`].
///
/// Every reader snapshot must hold a multiple of `rows_per_transaction`
/// rows. Returns the insert result and the number of torn snapshots seen.
pub fn stress_readers_and_writers(
    db: &Database,
    config: &StressConfig,
    readers: usize,
) -> (StressTestResult, usize) {
    let (done_tx, done_rx) = channel::bounded::<()>(0);
    let (torn_tx, torn_rx) = channel::unbounded::<usize>();

    let result = thread::scope(|s| {
        for _ in 0..readers {
            let done = done_rx.clone();
            let torn = torn_tx.clone();
            s.spawn(move || loop {
                if let Ok(rows) = db.read(|t| t.records(STRESS_TABLE)) {
                    if rows.len() % config.rows_per_transaction.max(1) != 0 {
                        let _ = torn.send(rows.len());
                    }
                }
                if done.try_recv() != Err(channel::TryRecvError::Empty) {
                    break;
                }
            });
        }
        let result = stress_concurrent_inserts(db, config);
        drop(done_tx);
        result
    });
    drop(torn_tx);
    (result, torn_rx.iter().count())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disjoint_inserts_all_commit() {
        let db = Database::open_in_memory().unwrap();
        create_stress_table(&db);
        let config = StressConfig {
            threads: 3,
            transactions: 10,
            rows_per_transaction: 2,
            key_space: 1_000_000,
        };
        let result = stress_concurrent_inserts(&db, &config);
        assert_eq!(result.successful_ops, 30);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(db.read(|t| t.records(STRESS_TABLE)).unwrap().len(), 60);
    }

    #[test]
    fn test_colliding_inserts_keep_keys_unique() {
        let db = Database::open_in_memory().unwrap();
        create_stress_table(&db);
        let config = StressConfig {
            threads: 4,
            transactions: 20,
            rows_per_transaction: 1,
            key_space: 8,
        };
        let result = stress_concurrent_inserts(&db, &config);
        assert_eq!(result.failed_ops, 0);
        let rows = db.read(|t| t.records(STRESS_TABLE)).unwrap();
        assert_eq!(rows.len(), result.successful_ops);
        assert!(rows.len() <= 8);
        assert_eq!(db.check().status, suneido_core::CheckStatus::Ok);
    }
}
