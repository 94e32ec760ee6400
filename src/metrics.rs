//! Metrics emitted by the sync layer
//!
//! Recording goes through the `metrics` facade and is a no-op until the
//! embedding application installs a recorder.

use metrics::{counter, gauge, histogram};

use crate::schema::Table;

/// Metric names and recording helpers
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncMetrics;

impl SyncMetrics {
    /// Feed events handled, by table and kind
    pub const FEED_EVENTS_TOTAL: &'static str = "skillswap_feed_events_total";
    /// Rows rejected at the boundary, by table
    pub const MALFORMED_ROWS_TOTAL: &'static str = "skillswap_malformed_rows_total";
    /// Feed connection drops
    pub const SUBSCRIPTION_DROPS_TOTAL: &'static str = "skillswap_subscription_drops_total";
    /// Authoritative cache reloads, by cache
    pub const CACHE_RELOADS_TOTAL: &'static str = "skillswap_cache_reloads_total";
    /// Patches discarded because a reload superseded them, by cache
    pub const STALE_PATCHES_TOTAL: &'static str = "skillswap_stale_patches_total";
    /// Unread counter reconciliations
    pub const UNREAD_RECONCILIATIONS_TOTAL: &'static str = "skillswap_unread_reconciliations_total";
    /// Absolute drift found by a reconciliation
    pub const UNREAD_DRIFT: &'static str = "skillswap_unread_drift";
    /// Current unread value
    pub const UNREAD_VALUE: &'static str = "skillswap_unread_value";
    /// Read retries, by operation
    pub const READ_RETRIES_TOTAL: &'static str = "skillswap_read_retries_total";
    /// Failed writes, by operation
    pub const WRITE_FAILURES_TOTAL: &'static str = "skillswap_write_failures_total";

    /// Count one handled feed event
    pub fn record_feed_event(table: Table, kind: &'static str) {
        counter!(Self::FEED_EVENTS_TOTAL, "table" => table.as_str(), "kind" => kind).increment(1);
    }

    /// Count one rejected row
    pub fn record_malformed_row(table: Table) {
        counter!(Self::MALFORMED_ROWS_TOTAL, "table" => table.as_str()).increment(1);
    }

    /// Count one connection drop
    pub fn record_subscription_drop() {
        counter!(Self::SUBSCRIPTION_DROPS_TOTAL).increment(1);
    }

    /// Count one completed reload
    pub fn record_cache_reload(cache: &'static str) {
        counter!(Self::CACHE_RELOADS_TOTAL, "cache" => cache).increment(1);
    }

    /// Count one discarded patch
    pub fn record_stale_patch(cache: &'static str) {
        counter!(Self::STALE_PATCHES_TOTAL, "cache" => cache).increment(1);
    }

    /// Record a reconciliation and the drift it corrected
    pub fn record_unread_reconciliation(value: u32, drift: i64) {
        counter!(Self::UNREAD_RECONCILIATIONS_TOTAL).increment(1);
        histogram!(Self::UNREAD_DRIFT).record(drift.unsigned_abs() as f64);
        gauge!(Self::UNREAD_VALUE).set(f64::from(value));
    }

    /// Count one retried read
    pub fn record_read_retry(operation: &'static str) {
        counter!(Self::READ_RETRIES_TOTAL, "operation" => operation).increment(1);
    }

    /// Count one failed write
    pub fn record_write_failure(operation: &'static str) {
        counter!(Self::WRITE_FAILURES_TOTAL, "operation" => operation).increment(1);
    }
}
