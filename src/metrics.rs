//! Metrics support for the server.

use iroh_metrics::{Counter, MetricsGroup};

/// Metrics for the autoupdate server.
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "autoupdate")]
pub struct Metrics {
    /// Number of subscriptions opened
    pub connections_opened: Counter,
    /// Number of payloads pushed to clients
    pub payloads_sent: Counter,
    /// Number of coalesced fetches against the upstream
    pub upstream_fetches: Counter,
    /// Number of keys requested from the upstream
    pub upstream_fetched_keys: Counter,
    /// Number of change batches ingested from the upstream
    pub change_events: Counter,
    /// Number of change feed interruptions
    pub change_feed_errors: Counter,
}
