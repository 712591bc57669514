//! Load drivers for concurrency tests.
//!
//! These run real workloads against a store from several threads and
//! report what happened; assertions stay with the caller.

use crate::fixtures::{PersonRecord, PERSON};
use boxdb_core::{CoreResult, Store};
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone, Default)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
}

impl StressTestResult {
    fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        Self {
            total_ops: successful + failed,
            successful_ops: successful,
            failed_ops: failed,
            duration,
        }
    }

    /// Operations per second.
    #[allow(clippy::cast_precision_loss)]
    pub fn ops_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.total_ops as f64 / secs
        } else {
            0.0
        }
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Operations per thread.
    pub operations: usize,
    /// Number of writer threads.
    pub writers: usize,
    /// Number of reader threads.
    pub readers: usize,
    /// Objects put per write transaction.
    pub batch: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 200,
            writers: 2,
            readers: 4,
            batch: 5,
        }
    }
}

fn tally(results: Vec<CoreResult<()>>, start: Instant) -> StressTestResult {
    let successful = results.iter().filter(|r| r.is_ok()).count();
    StressTestResult::new(successful, results.len() - successful, start.elapsed())
}

/// Runs writer threads that put batches of persons in write transactions.
///
/// Every transaction commits `config.batch` objects, so a run with no
/// failures adds `writers * operations * batch` persons.
pub fn stress_concurrent_writes(store: &Store, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let results = thread::scope(|scope| {
        let handles: Vec<_> = (0..config.writers)
            .map(|writer| {
                scope.spawn(move || {
                    (0..config.operations)
                        .map(|op| {
                            store.run_in_write_tx(|_| {
                                let people = store.entity_box(PERSON)?;
                                for n in 0..config.batch {
                                    let name = format!("w{writer}-{op}-{n}");
                                    people.put(0, PersonRecord::new(&name).encode())?;
                                }
                                Ok(())
                            })
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap_or_default())
            .collect::<Vec<_>>()
    });
    tally(results, start)
}

/// Runs readers next to writers and checks that every read transaction
/// sees a whole number of batches.
///
/// A reader that observes a count not divisible by `config.batch` saw a
/// partial commit and is reported as a failed operation.
pub fn stress_snapshot_reads(store: &Store, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let batch = config.batch.max(1) as u64;
    let results = thread::scope(|scope| {
        let writer = scope.spawn(|| stress_concurrent_writes(store, config));
        let readers: Vec<_> = (0..config.readers)
            .map(|_| {
                scope.spawn(move || {
                    (0..config.operations)
                        .map(|_| {
                            store.run_in_read_tx(|_| {
                                let people = store.entity_box(PERSON)?;
                                let first = people.count(0)?;
                                let second = people.count(0)?;
                                if first % batch != 0 || first != second {
                                    return Err(boxdb_core::CoreError::illegal_state(format!(
                                        "read {first} then {second} objects"
                                    )));
                                }
                                Ok(())
                            })
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut results: Vec<CoreResult<()>> = readers
            .into_iter()
            .flat_map(|h| h.join().unwrap_or_default())
            .collect();
        if let Ok(writes) = writer.join() {
            results.extend((0..writes.failed_ops).map(|_| {
                Err(boxdb_core::CoreError::illegal_state("write failed"))
            }));
        }
        results
    });
    tally(results, start)
}
