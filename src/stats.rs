//! Client metrics.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! host application installs a recorder.

use metrics::{counter, gauge};

/// Count one retry of a failed attempt
pub fn record_retry(operation: &'static str) {
    counter!(
        "tablestore_retry_attempts_total",
        "operation" => operation
    )
    .increment(1);
}

/// Count one rebuild of a reloadable client
pub fn record_reconnect(target: &'static str) {
    counter!(
        "tablestore_reconnects_total",
        "target" => target
    )
    .increment(1);
}

/// Current row count of a cache mirror
pub fn set_cache_rows(table: &str, rows: usize) {
    gauge!(
        "tablestore_cache_rows",
        "table" => table.to_string()
    )
    .set(rows as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder() {
        record_retry("get");
        record_reconnect("table");
        set_cache_rows("orders", 3);
    }
}
