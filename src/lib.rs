//! An autoupdate server that pushes datastore changes to subscribed clients.
//!
//! Clients open a long-lived HTTP request for a set of keys (plain, or
//! structured requests whose relation fields expand recursively) and receive
//! a JSON payload whenever any of those keys changes upstream.  Values are
//! served from an in-process cache that coalesces concurrent misses into one
//! upstream fetch and stays correct when invalidations arrive while a fetch
//! is still in flight.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod autoupdate;
pub mod config;
pub mod datastore;
pub mod http;
pub mod metrics;
pub mod server;
pub mod state;
pub mod topic;
