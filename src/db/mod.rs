mod from_row;
pub mod queries;
mod schema;

pub use from_row::FromRow;
pub use schema::{init_audit_db, init_db};

use std::sync::Arc;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::fees::FeeCalculator;
use crate::payments::ProcessorRegistry;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Application state holding database pools, processor clients, and
/// reconciliation configuration.
#[derive(Clone)]
pub struct AppState {
    /// Main database pool (donors, gifts, plans, receipts, webhook events)
    pub db: DbPool,
    /// Audit log database pool (separate file to isolate growth)
    pub audit: DbPool,
    /// Configured payment processor clients
    pub processors: Arc<ProcessorRegistry>,
    /// Per-processor fee schedules
    pub fees: Arc<FeeCalculator>,
    /// Shared outbound HTTP client for the notification side channel
    pub http_client: reqwest::Client,
    /// Fire-and-forget notification webhook target (None = disabled)
    pub notify_webhook_url: Option<String>,
    pub audit_log_enabled: bool,
    /// Failed recurring charges tolerated before a plan is auto-paused
    pub dunning_max_attempts: u32,
}

pub fn create_pool(database_path: &str) -> Result<DbPool, r2d2::Error> {
    let manager = SqliteConnectionManager::file(database_path);
    Pool::builder().max_size(10).build(manager)
}
