//! Stress harnesses for contended transactions and listener fan-out.
//!
//! Several databases share one [`MemoryServer`] and hammer overlapping
//! paths from their own threads.

use crate::fixtures::{eventually, transaction_latch, EventRecorder, TestDatabase, DEFAULT_TIMEOUT};
use crate::server::MemoryServer;
use rtdb_core::{EventMask, TransactionOutcome};
use serde_json::{json, Value};
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Operations attempted.
    pub total_ops: usize,
    /// Operations that committed or were delivered.
    pub successful_ops: usize,
    /// Operations that aborted or timed out.
    pub failed_ops: usize,
    /// Wall time.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };
        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Stress run parameters.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of client databases.
    pub clients: usize,
    /// Operations issued by each client.
    pub ops_per_client: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            clients: 4,
            ops_per_client: 25,
        }
    }
}

/// Every client increments `path` by one per operation through
/// transactions. Returns the run result and the final server value.
pub fn stress_counter_contention(
    server: &MemoryServer,
    path: &str,
    config: &StressConfig,
) -> (StressTestResult, Value) {
    let clients: Vec<TestDatabase> = (0..config.clients)
        .map(|_| TestDatabase::with_server(server))
        .collect();
    for client in &clients {
        eventually("client connection", || client.connection.is_online());
    }

    let start = Instant::now();
    let outcomes: Vec<(usize, usize)> = thread::scope(|scope| {
        let handles: Vec<_> = clients
            .iter()
            .map(|client| {
                scope.spawn(move || {
                    let reference = client.reference(path).expect("Invalid stress path");
                    let mut latches = Vec::with_capacity(config.ops_per_client);
                    for _ in 0..config.ops_per_client {
                        let (latch, on_complete) = transaction_latch();
                        let started = reference.run_transaction(
                            |current| {
                                let n = current.to_json_value().as_i64().unwrap_or(0);
                                TransactionOutcome::success(n + 1)
                            },
                            on_complete,
                            true,
                        );
                        if started.is_ok() {
                            latches.push(latch);
                        }
                    }
                    let mut committed = 0;
                    let mut failed = config.ops_per_client - latches.len();
                    for latch in latches {
                        match latch.wait(DEFAULT_TIMEOUT) {
                            Some(result) if result.committed => committed += 1,
                            _ => failed += 1,
                        }
                    }
                    (committed, failed)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or((0, config.ops_per_client)))
            .collect()
    });

    let (successful, failed) = outcomes
        .into_iter()
        .fold((0, 0), |(s, f), (cs, cf)| (s + cs, f + cf));
    let result = StressTestResult::new(successful, failed, start.elapsed());
    (result, server.value(path))
}

/// One client writes `config.ops_per_client` values at `path` while every
/// other client listens. Returns the run result, counting listeners that
/// saw the final value as successful.
pub fn stress_listener_fanout(
    server: &MemoryServer,
    path: &str,
    config: &StressConfig,
) -> StressTestResult {
    let clients: Vec<TestDatabase> = (0..config.clients.max(2))
        .map(|_| TestDatabase::with_server(server))
        .collect();
    let (writer, listeners) = clients.split_first().expect("At least two clients");

    let recorders: Vec<EventRecorder> = listeners
        .iter()
        .map(|client| {
            let recorder = EventRecorder::new();
            client
                .reference(path)
                .expect("Invalid stress path")
                .add_listener(EventMask::VALUE, recorder.clone())
                .expect("Failed to add listener");
            recorder
        })
        .collect();

    let start = Instant::now();
    let reference = writer.reference(path).expect("Invalid stress path");
    let last = config.ops_per_client.saturating_sub(1);
    for i in 0..config.ops_per_client {
        let _ = reference.set_value(i as i64);
    }
    writer.settle();

    let expected = json!(last as i64);
    let deadline = Instant::now() + DEFAULT_TIMEOUT;
    let mut successful = 0;
    for recorder in &recorders {
        while Instant::now() < deadline && recorder.values().last() != Some(&expected) {
            thread::sleep(Duration::from_millis(2));
        }
        if recorder.values().last() == Some(&expected) {
            successful += 1;
        }
    }
    StressTestResult::new(successful, recorders.len() - successful, start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contended_counter_counts_every_commit() {
        let server = MemoryServer::new();
        let config = StressConfig {
            clients: 3,
            ops_per_client: 10,
        };
        let (result, value) = stress_counter_contention(&server, "counter", &config);
        assert_eq!(result.total_ops, 30);
        assert_eq!(value, json!(result.successful_ops as i64));
    }

    #[test]
    fn every_listener_sees_the_last_write() {
        let server = MemoryServer::new();
        let config = StressConfig {
            clients: 4,
            ops_per_client: 20,
        };
        let result = stress_listener_fanout(&server, "feed", &config);
        assert_eq!(result.successful_ops, 3);
        assert_eq!(result.failed_ops, 0);
    }
}
