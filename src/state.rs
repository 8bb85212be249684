//! Shared state of the HTTP handlers.

use std::sync::Arc;

use crate::{autoupdate::Autoupdate, http::Auth, metrics::Metrics};

/// The shared app state.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The autoupdate service.
    pub autoupdate: Autoupdate,
    /// Resolves the requesting user.
    pub auth: Arc<dyn Auth>,
    /// Metrics collector.
    pub metrics: Arc<Metrics>,
}
