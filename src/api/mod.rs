use std::{collections::HashMap, convert::Infallible, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{
        rejection::JsonRejection, ConnectInfo, DefaultBodyLimit, FromRequestParts, Path, State,
    },
    http::{header, request::Parts, HeaderMap, HeaderValue, Method, Uri},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    capture::{CaptureIngestor, CaptureInput, HeaderPolicy},
    config::ServiceOptions,
    db::{Ledger, REQUEST_LIST_LIMIT},
    domain::{
        CaptureResponse, Identity, RegisterResponse, ReplayRequest, ReplayResponse,
        RequestWithReplays,
    },
    errors::AppError,
    identity::{CallerContext, IdentityManager, ResolvedIdentity, CREDENTIAL_MAX_AGE_SECS},
    limiter::RateLimiter,
    replay::ReplayEngine,
};

/// Cookie carrying the caller's identity token.
pub const IDENT_COOKIE: &str = "ident";

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn Ledger>,
    pub identities: IdentityManager,
    pub ingestor: CaptureIngestor,
    pub limiter: RateLimiter,
    pub engine: ReplayEngine,
    pub options: ServiceOptions,
}

impl AppState {
    pub fn new(ledger: Arc<dyn Ledger>, client: reqwest::Client, options: ServiceOptions) -> Self {
        let identities = IdentityManager::new(Arc::clone(&ledger));
        let headers = HeaderPolicy::new(options.client_address_header.as_str());
        Self {
            ingestor: CaptureIngestor::new(
                identities.clone(),
                Arc::clone(&ledger),
                headers.clone(),
            ),
            limiter: RateLimiter::new(Arc::clone(&ledger)),
            engine: ReplayEngine::new(
                Arc::clone(&ledger),
                client,
                headers,
                options.replay_timeout,
                options.dev_mode,
            ),
            identities,
            ledger,
            options,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/create/:ident", any(capture))
        .route("/create/:ident/*rest", any(capture))
        .route("/requests", get(list_requests))
        .route("/replay", post(replay))
        .route("/register", post(register))
        .layer(DefaultBodyLimit::max(state.options.max_webhook_size_bytes))
        .layer(TraceLayer::new_for_http());

    if state.options.dev_mode {
        tracing::warn!("development mode: cross-origin requests and loopback replays allowed");
        router = router.layer(CorsLayer::very_permissive());
    }

    router.with_state(state)
}

#[async_trait]
impl FromRequestParts<AppState> for CallerContext {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());

        let forwarded = parts
            .headers
            .get(state.options.client_address_header.as_str())
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned);

        Ok(CallerContext {
            token: identity_token(&parts.headers),
            user_agent: parts
                .headers
                .get(header::USER_AGENT)
                .and_then(|value| value.to_str().ok())
                .map(ToOwned::to_owned),
            source_address: forwarded.or(peer),
        })
    }
}

async fn capture(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CaptureResponse>, AppError> {
    let target_ident = params.get("ident").cloned().unwrap_or_default();

    let created_id = state
        .ingestor
        .capture(CaptureInput {
            target_ident,
            method: method.to_string(),
            url: uri.to_string(),
            body: body.to_vec(),
            headers,
        })
        .await?;

    Ok(Json(CaptureResponse {
        created_id,
        success: true,
        error: None,
    }))
}

async fn list_requests(
    State(state): State<AppState>,
    caller: CallerContext,
) -> Result<Response, AppError> {
    let resolved = state.identities.resolve_from_caller(&caller).await?;
    let listed = requests_of(&state, &resolved.identity).await;
    with_credential(&resolved, listed)
}

async fn requests_of(
    state: &AppState,
    owner: &Identity,
) -> Result<Json<Vec<RequestWithReplays>>, AppError> {
    let requests = state
        .ledger
        .list_requests_for_owner(&owner.token, REQUEST_LIST_LIMIT)
        .await?;

    tracing::info!(
        identity_id = owner.id,
        count = requests.len(),
        "returning captured requests"
    );
    Ok(Json(requests))
}

async fn replay(
    State(state): State<AppState>,
    caller: CallerContext,
    payload: Result<Json<ReplayRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let resolved = state.identities.resolve_from_caller(&caller).await?;
    let replayed = replay_as(&state, &resolved.identity, payload).await;
    with_credential(&resolved, replayed)
}

async fn replay_as(
    state: &AppState,
    caller: &Identity,
    payload: Result<Json<ReplayRequest>, JsonRejection>,
) -> Result<Json<ReplayResponse>, AppError> {
    let Json(payload) = payload.map_err(|err| {
        AppError::BadRequest(format!(
            "Could not bind to replay request model: {}",
            err.body_text()
        ))
    })?;

    state.limiter.check().await?;

    let replay_id = state
        .engine
        .execute(caller, payload.request_id, &payload.destination)
        .await?;

    Ok(Json(ReplayResponse { replay_id }))
}

async fn register(
    State(state): State<AppState>,
    caller: CallerContext,
) -> Result<Response, AppError> {
    let identity = state
        .identities
        .register_anonymous(caller.user_agent, caller.source_address)
        .await?;

    let mut response = Json(RegisterResponse {
        ident: identity.token.clone(),
    })
    .into_response();
    set_credential(&mut response, &identity.token)?;
    Ok(response)
}

fn identity_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .map(str::trim)
        .find_map(|cookie| {
            cookie
                .strip_prefix(IDENT_COOKIE)
                .and_then(|rest| rest.strip_prefix('='))
        })
        .map(ToOwned::to_owned)
}

/// Hands a freshly minted credential back on every response, error responses
/// included, so the caller stops presenting the stale one.
fn with_credential(
    resolved: &ResolvedIdentity,
    body: impl IntoResponse,
) -> Result<Response, AppError> {
    let mut response = body.into_response();
    if resolved.registered {
        set_credential(&mut response, &resolved.identity.token)?;
    }
    Ok(response)
}

fn set_credential(response: &mut Response, token: &str) -> Result<(), AppError> {
    let cookie = format!(
        "{IDENT_COOKIE}={token}; Path=/; Max-Age={CREDENTIAL_MAX_AGE_SECS}; HttpOnly; SameSite=Lax"
    );
    let value = HeaderValue::from_str(&cookie)
        .map_err(|_| AppError::Internal("identity token is not a valid cookie value".to_owned()))?;
    response.headers_mut().append(header::SET_COOKIE, value);
    Ok(())
}
