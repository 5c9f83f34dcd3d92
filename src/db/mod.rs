use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::{
    domain::{
        CapturedRequest, Identity, NewCapturedRequest, NewIdentity, NewReplay, RequestWithReplays,
    },
    errors::AppError,
};

pub mod memory;
pub mod pg;

/// Pool size used when the deployment does not configure one.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;
/// Most recent requests returned for one identity.
pub const REQUEST_LIST_LIMIT: i64 = 50;
/// Most recent replays attached to each listed request.
pub const REPLAYS_PER_REQUEST: i64 = 50;

/// Durable store for identities, captured requests, replays and their headers.
///
/// Every multi-row write (a request with its headers, a replay with its
/// response headers) commits as one unit: readers never see an owner row
/// without its header set.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn create_identity(&self, identity: NewIdentity) -> Result<Identity, AppError>;
    async fn get_identity_by_token(&self, token: &str) -> Result<Identity, AppError>;
    async fn save_request(&self, request: NewCapturedRequest) -> Result<i64, AppError>;
    async fn save_replay(&self, replay: NewReplay) -> Result<i64, AppError>;
    async fn get_request(&self, id: i64) -> Result<CapturedRequest, AppError>;
    async fn list_requests_for_owner(
        &self,
        owner_token: &str,
        limit: i64,
    ) -> Result<Vec<RequestWithReplays>, AppError>;
    /// Counts replays across all identities that ended strictly after `since`.
    async fn count_replays_since(&self, since: DateTime<Utc>) -> Result<i64, AppError>;
}

pub async fn connect(database_url: &str) -> Result<PgPool, AppError> {
    connect_with(database_url, DEFAULT_MAX_CONNECTIONS).await
}

pub async fn connect_with(database_url: &str, max_connections: u32) -> Result<PgPool, AppError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), AppError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|err| AppError::Internal(format!("migration failed: {err}")))
}
