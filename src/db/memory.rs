use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    db::{Ledger, REPLAYS_PER_REQUEST},
    domain::{
        CapturedRequest, Header, HeaderOwner, Identity, NewCapturedRequest, NewIdentity,
        NewReplay, Replay, ReplayOutcome, RequestWithReplays,
    },
    errors::AppError,
};

/// In-process ledger. All tables sit behind one lock, so a request or replay
/// and its headers become visible together.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    tables: Arc<RwLock<Tables>>,
}

#[derive(Default)]
struct Tables {
    identities: Vec<Identity>,
    requests: Vec<RequestRecord>,
    replays: Vec<ReplayRecord>,
    headers: Vec<HeaderRecord>,
    next_id: i64,
}

struct RequestRecord {
    id: i64,
    owner_token: String,
    method: String,
    target_url: String,
    body: Vec<u8>,
    received_at: DateTime<Utc>,
}

struct ReplayRecord {
    id: i64,
    request_id: i64,
    destination: String,
    outcome: ReplayOutcome,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
}

struct HeaderRecord {
    owner: HeaderOwner,
    header: Header,
}

impl Tables {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn headers_of(&self, owner: HeaderOwner) -> Vec<Header> {
        self.headers
            .iter()
            .filter(|record| record.owner == owner)
            .map(|record| record.header.clone())
            .collect()
    }

    fn request(&self, record: &RequestRecord) -> CapturedRequest {
        CapturedRequest {
            id: record.id,
            owner_token: record.owner_token.clone(),
            method: record.method.clone(),
            target_url: record.target_url.clone(),
            body: record.body.clone(),
            headers: self.headers_of(HeaderOwner::Request(record.id)),
            received_at: record.received_at,
        }
    }

    fn replay(&self, record: &ReplayRecord) -> Replay {
        let outcome = match &record.outcome {
            ReplayOutcome::Completed {
                status_code,
                response_body,
                ..
            } => ReplayOutcome::Completed {
                status_code: *status_code,
                response_body: response_body.clone(),
                response_headers: self.headers_of(HeaderOwner::Replay(record.id)),
            },
            failed @ ReplayOutcome::Failed { .. } => failed.clone(),
        };

        Replay {
            id: record.id,
            request_id: record.request_id,
            destination: record.destination.clone(),
            outcome,
            started_at: record.started_at,
            ended_at: record.ended_at,
        }
    }

    fn push_headers(&mut self, owner: HeaderOwner, headers: &[Header]) {
        self.headers
            .extend(headers.iter().cloned().map(|header| HeaderRecord { owner, header }));
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn create_identity(&self, identity: NewIdentity) -> Result<Identity, AppError> {
        let mut tables = self.tables.write().await;
        if tables
            .identities
            .iter()
            .any(|existing| existing.token == identity.token)
        {
            return Err(AppError::Internal(
                "identity token already registered".to_owned(),
            ));
        }

        let stored = Identity {
            id: tables.allocate_id(),
            token: identity.token,
            created_at: Utc::now(),
            user_agent: identity.user_agent,
            source_address: identity.source_address,
        };
        tables.identities.push(stored.clone());
        Ok(stored)
    }

    async fn get_identity_by_token(&self, token: &str) -> Result<Identity, AppError> {
        self.tables
            .read()
            .await
            .identities
            .iter()
            .find(|identity| identity.token == token)
            .cloned()
            .ok_or_else(|| AppError::not_found("identity not found"))
    }

    async fn save_request(&self, request: NewCapturedRequest) -> Result<i64, AppError> {
        let mut tables = self.tables.write().await;
        let id = tables.allocate_id();
        tables.requests.push(RequestRecord {
            id,
            owner_token: request.owner_token,
            method: request.method,
            target_url: request.target_url,
            body: request.body,
            received_at: Utc::now(),
        });
        tables.push_headers(HeaderOwner::Request(id), &request.headers);
        Ok(id)
    }

    async fn save_replay(&self, replay: NewReplay) -> Result<i64, AppError> {
        let mut tables = self.tables.write().await;
        if !tables
            .requests
            .iter()
            .any(|request| request.id == replay.request_id)
        {
            return Err(AppError::not_found(format!(
                "request not found: {}",
                replay.request_id
            )));
        }

        let id = tables.allocate_id();
        tables.push_headers(HeaderOwner::Replay(id), replay.outcome.response_headers());
        tables.replays.push(ReplayRecord {
            id,
            request_id: replay.request_id,
            destination: replay.destination,
            outcome: replay.outcome,
            started_at: replay.started_at,
            ended_at: replay.ended_at,
        });
        Ok(id)
    }

    async fn get_request(&self, id: i64) -> Result<CapturedRequest, AppError> {
        let tables = self.tables.read().await;
        tables
            .requests
            .iter()
            .find(|request| request.id == id)
            .map(|record| tables.request(record))
            .ok_or_else(|| AppError::not_found(format!("request not found: {id}")))
    }

    async fn list_requests_for_owner(
        &self,
        owner_token: &str,
        limit: i64,
    ) -> Result<Vec<RequestWithReplays>, AppError> {
        let tables = self.tables.read().await;

        let mut owned: Vec<&RequestRecord> = tables
            .requests
            .iter()
            .filter(|request| request.owner_token == owner_token)
            .collect();
        owned.sort_by(|a, b| (b.received_at, b.id).cmp(&(a.received_at, a.id)));

        let limit = usize::try_from(limit).unwrap_or(0);
        let per_request = usize::try_from(REPLAYS_PER_REQUEST).unwrap_or(0);

        Ok(owned
            .into_iter()
            .take(limit)
            .map(|record| {
                let mut replays: Vec<&ReplayRecord> = tables
                    .replays
                    .iter()
                    .filter(|replay| replay.request_id == record.id)
                    .collect();
                replays.sort_by(|a, b| (b.ended_at, b.id).cmp(&(a.ended_at, a.id)));

                RequestWithReplays {
                    request: tables.request(record),
                    replays: replays
                        .into_iter()
                        .take(per_request)
                        .map(|replay| tables.replay(replay))
                        .collect(),
                }
            })
            .collect())
    }

    async fn count_replays_since(&self, since: DateTime<Utc>) -> Result<i64, AppError> {
        let count = self
            .tables
            .read()
            .await
            .replays
            .iter()
            .filter(|replay| replay.ended_at > since)
            .count();
        Ok(count as i64)
    }
}
