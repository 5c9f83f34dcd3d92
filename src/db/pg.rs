use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::{
    db::{Ledger, REPLAYS_PER_REQUEST},
    domain::{
        CapturedRequest, Header, HeaderOwner, Identity, NewCapturedRequest, NewIdentity,
        NewReplay, Replay, ReplayOutcome, RequestWithReplays,
    },
    errors::AppError,
};

const REQUEST_HEADERS_SQL: &str = r#"
    SELECT request_id AS owner_id, key, value
    FROM headers
    WHERE request_id = ANY($1)
    ORDER BY id ASC
"#;

const REPLAY_HEADERS_SQL: &str = r#"
    SELECT replay_id AS owner_id, key, value
    FROM headers
    WHERE replay_id = ANY($1)
    ORDER BY id ASC
"#;

#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct RequestRow {
    id: i64,
    owner_token: String,
    method: String,
    target_url: String,
    body: Vec<u8>,
    received_at: DateTime<Utc>,
}

impl RequestRow {
    fn into_request(self, headers: Vec<Header>) -> CapturedRequest {
        CapturedRequest {
            id: self.id,
            owner_token: self.owner_token,
            method: self.method,
            target_url: self.target_url,
            body: self.body,
            headers,
            received_at: self.received_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ReplayRow {
    id: i64,
    request_id: i64,
    destination: String,
    status_code: Option<i32>,
    response_body: Option<Vec<u8>>,
    error_message: Option<String>,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
}

impl ReplayRow {
    fn into_replay(self, headers: Vec<Header>) -> Result<Replay, AppError> {
        let outcome = match (self.status_code, self.response_body, self.error_message) {
            (Some(status_code), Some(response_body), None) => ReplayOutcome::Completed {
                status_code: u16::try_from(status_code).map_err(|_| {
                    AppError::Internal(format!(
                        "replay {} has invalid status code {status_code}",
                        self.id
                    ))
                })?,
                response_body,
                response_headers: headers,
            },
            (None, None, Some(error_message)) => ReplayOutcome::Failed { error_message },
            _ => {
                return Err(AppError::Internal(format!(
                    "replay {} has an inconsistent outcome",
                    self.id
                )))
            }
        };

        Ok(Replay {
            id: self.id,
            request_id: self.request_id,
            destination: self.destination,
            outcome,
            started_at: self.started_at,
            ended_at: self.ended_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HeaderRow {
    owner_id: i64,
    key: String,
    value: String,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn headers_by_owner(
        &self,
        sql: &'static str,
        owner_ids: &[i64],
    ) -> Result<HashMap<i64, Vec<Header>>, AppError> {
        if owner_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query_as::<_, HeaderRow>(sql)
            .bind(owner_ids)
            .fetch_all(&self.pool)
            .await?;

        let mut grouped: HashMap<i64, Vec<Header>> = HashMap::new();
        for row in rows {
            grouped
                .entry(row.owner_id)
                .or_default()
                .push(Header::new(row.key, row.value));
        }
        Ok(grouped)
    }
}

// Dropping the transaction without commit rolls it back, so any `?` below
// leaves neither the owner row nor a partial header set behind.
async fn insert_headers(
    tx: &mut Transaction<'_, Postgres>,
    owner: HeaderOwner,
    headers: &[Header],
) -> Result<(), AppError> {
    for header in headers {
        sqlx::query(
            r#"
            INSERT INTO headers (request_id, replay_id, key, value)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(owner.request_id())
        .bind(owner.replay_id())
        .bind(&header.key)
        .bind(&header.value)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[async_trait]
impl Ledger for PgLedger {
    async fn create_identity(&self, identity: NewIdentity) -> Result<Identity, AppError> {
        let created = sqlx::query_as::<_, Identity>(
            r#"
            INSERT INTO identities (token, user_agent, source_address)
            VALUES ($1, $2, $3)
            RETURNING id, token, created_at, user_agent, source_address
            "#,
        )
        .bind(identity.token)
        .bind(identity.user_agent)
        .bind(identity.source_address)
        .fetch_one(&self.pool)
        .await?;

        Ok(created)
    }

    async fn get_identity_by_token(&self, token: &str) -> Result<Identity, AppError> {
        let identity = sqlx::query_as::<_, Identity>(
            r#"
            SELECT id, token, created_at, user_agent, source_address
            FROM identities
            WHERE token = $1
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        identity.ok_or_else(|| AppError::not_found("identity not found"))
    }

    async fn save_request(&self, request: NewCapturedRequest) -> Result<i64, AppError> {
        let mut tx = self.pool.begin().await?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO requests (owner_token, method, target_url, body)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&request.owner_token)
        .bind(&request.method)
        .bind(&request.target_url)
        .bind(&request.body)
        .fetch_one(&mut *tx)
        .await?;

        insert_headers(&mut tx, HeaderOwner::Request(id), &request.headers).await?;
        tx.commit().await?;

        tracing::debug!(request_id = id, method = %request.method, "request saved");
        Ok(id)
    }

    async fn save_replay(&self, replay: NewReplay) -> Result<i64, AppError> {
        let mut tx = self.pool.begin().await?;

        let request_exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM requests WHERE id = $1)")
                .bind(replay.request_id)
                .fetch_one(&mut *tx)
                .await?;
        if !request_exists {
            return Err(AppError::not_found(format!(
                "request not found: {}",
                replay.request_id
            )));
        }

        let (status_code, response_body, error_message) = match &replay.outcome {
            ReplayOutcome::Completed {
                status_code,
                response_body,
                ..
            } => (Some(i32::from(*status_code)), Some(response_body.as_slice()), None),
            ReplayOutcome::Failed { error_message } => (None, None, Some(error_message.as_str())),
        };

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO replays
                (request_id, destination, status_code, response_body, started_at, ended_at, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(replay.request_id)
        .bind(&replay.destination)
        .bind(status_code)
        .bind(response_body)
        .bind(replay.started_at)
        .bind(replay.ended_at)
        .bind(error_message)
        .fetch_one(&mut *tx)
        .await?;

        insert_headers(
            &mut tx,
            HeaderOwner::Replay(id),
            replay.outcome.response_headers(),
        )
        .await?;
        tx.commit().await?;

        Ok(id)
    }

    async fn get_request(&self, id: i64) -> Result<CapturedRequest, AppError> {
        let row = sqlx::query_as::<_, RequestRow>(
            r#"
            SELECT id, owner_token, method, target_url, body, received_at
            FROM requests
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::not_found(format!("request not found: {id}")))?;

        let mut headers = self.headers_by_owner(REQUEST_HEADERS_SQL, &[id]).await?;
        Ok(row.into_request(headers.remove(&id).unwrap_or_default()))
    }

    async fn list_requests_for_owner(
        &self,
        owner_token: &str,
        limit: i64,
    ) -> Result<Vec<RequestWithReplays>, AppError> {
        let rows = sqlx::query_as::<_, RequestRow>(
            r#"
            SELECT id, owner_token, method, target_url, body, received_at
            FROM requests
            WHERE owner_token = $1
            ORDER BY received_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(owner_token)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let request_ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
        let mut request_headers = self
            .headers_by_owner(REQUEST_HEADERS_SQL, &request_ids)
            .await?;

        let replay_rows = if request_ids.is_empty() {
            Vec::new()
        } else {
            sqlx::query_as::<_, ReplayRow>(
                r#"
                SELECT id, request_id, destination, status_code, response_body,
                       error_message, started_at, ended_at
                FROM (
                    SELECT replays.*,
                           ROW_NUMBER() OVER (
                               PARTITION BY request_id ORDER BY ended_at DESC, id DESC
                           ) AS rank_in_request
                    FROM replays
                    WHERE request_id = ANY($1)
                ) ranked
                WHERE rank_in_request <= $2
                ORDER BY request_id, ended_at DESC, id DESC
                "#,
            )
            .bind(&request_ids)
            .bind(REPLAYS_PER_REQUEST)
            .fetch_all(&self.pool)
            .await?
        };

        let replay_ids: Vec<i64> = replay_rows.iter().map(|row| row.id).collect();
        let mut replay_headers = self
            .headers_by_owner(REPLAY_HEADERS_SQL, &replay_ids)
            .await?;

        let mut replays_by_request: HashMap<i64, Vec<Replay>> = HashMap::new();
        for row in replay_rows {
            let headers = replay_headers.remove(&row.id).unwrap_or_default();
            let replay = row.into_replay(headers)?;
            replays_by_request
                .entry(replay.request_id)
                .or_default()
                .push(replay);
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let id = row.id;
                RequestWithReplays {
                    request: row.into_request(request_headers.remove(&id).unwrap_or_default()),
                    replays: replays_by_request.remove(&id).unwrap_or_default(),
                }
            })
            .collect())
    }

    async fn count_replays_since(&self, since: DateTime<Utc>) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM replays WHERE ended_at > $1")
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
