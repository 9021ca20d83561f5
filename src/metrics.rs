//! Lightweight in-memory counters for the audit and recovery writers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use serde::Serialize;

#[derive(Default)]
struct WriterMetrics {
    change_batches: AtomicU64,
    change_records: AtomicU64,
    query_records: AtomicU64,
    skipped_reads: AtomicU64,
    audit_failures: AtomicU64,
    recovery_failures: AtomicU64,
    write_total_us: AtomicU64,
    write_max_us: AtomicU64,
}

static WRITER_METRICS: OnceLock<WriterMetrics> = OnceLock::new();

fn metrics() -> &'static WriterMetrics {
    WRITER_METRICS.get_or_init(WriterMetrics::default)
}

fn record_latency(elapsed: Duration) {
    let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
    let metrics = metrics();
    metrics.write_total_us.fetch_add(micros, Ordering::Relaxed);

    let mut current = metrics.write_max_us.load(Ordering::Relaxed);
    while micros > current {
        match metrics.write_max_us.compare_exchange(
            current,
            micros,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(next) => current = next,
        }
    }
}

/// One audit transaction carrying `records` change records.
pub fn record_change_batch(records: usize, elapsed: Duration, success: bool) {
    let metrics = metrics();
    if success {
        metrics.change_batches.fetch_add(1, Ordering::Relaxed);
        metrics
            .change_records
            .fetch_add(records as u64, Ordering::Relaxed);
    } else {
        metrics.audit_failures.fetch_add(1, Ordering::Relaxed);
    }
    record_latency(elapsed);
}

pub fn record_query_write(elapsed: Duration, success: bool) {
    let metrics = metrics();
    if success {
        metrics.query_records.fetch_add(1, Ordering::Relaxed);
    } else {
        metrics.recovery_failures.fetch_add(1, Ordering::Relaxed);
    }
    record_latency(elapsed);
}

pub fn record_skipped_read() {
    metrics().skipped_reads.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Serialize)]
pub struct WriterMetricsSnapshot {
    pub change_batches: u64,
    pub change_records: u64,
    pub query_records: u64,
    pub skipped_reads: u64,
    pub audit_failures: u64,
    pub recovery_failures: u64,
    pub avg_write_us: Option<f64>,
    pub max_write_us: Option<u64>,
}

pub fn snapshot() -> WriterMetricsSnapshot {
    let metrics = metrics();
    let change_batches = metrics.change_batches.load(Ordering::Relaxed);
    let query_records = metrics.query_records.load(Ordering::Relaxed);
    let audit_failures = metrics.audit_failures.load(Ordering::Relaxed);
    let recovery_failures = metrics.recovery_failures.load(Ordering::Relaxed);
    let writes = change_batches + query_records + audit_failures + recovery_failures;
    let total_us = metrics.write_total_us.load(Ordering::Relaxed);
    let max_us = metrics.write_max_us.load(Ordering::Relaxed);

    WriterMetricsSnapshot {
        change_batches,
        change_records: metrics.change_records.load(Ordering::Relaxed),
        query_records,
        skipped_reads: metrics.skipped_reads.load(Ordering::Relaxed),
        audit_failures,
        recovery_failures,
        avg_write_us: if writes > 0 {
            Some(total_us as f64 / writes as f64)
        } else {
            None
        },
        max_write_us: if max_us > 0 { Some(max_us) } else { None },
    }
}
