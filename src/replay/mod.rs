//! Replay of captured requests.
//!
//! An attempt moves through ownership verification and the destination guard
//! before anything is sent. Rejections at those stages leave no trace in the
//! ledger. Once the outbound call is issued, every ending is stored: a
//! response becomes a completed replay, a transport or body-read failure
//! becomes a failed replay, and the caller gets the replay id either way.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use subtle::ConstantTimeEq;
use url::Url;

use crate::{
    capture::HeaderPolicy,
    db::Ledger,
    domain::{CapturedRequest, Header, Identity, NewReplay, ReplayOutcome},
    errors::AppError,
};

pub mod guard;

pub const DEFAULT_REPLAY_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound client settings shared by every replay: redirects are followed
/// only while each hop passes the destination guard.
pub fn client_builder(dev_mode: bool) -> reqwest::ClientBuilder {
    reqwest::Client::builder().redirect(guard::redirect_policy(dev_mode))
}

#[derive(Clone)]
pub struct ReplayEngine {
    ledger: Arc<dyn Ledger>,
    client: reqwest::Client,
    headers: HeaderPolicy,
    timeout: Duration,
    dev_mode: bool,
}

impl ReplayEngine {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        client: reqwest::Client,
        headers: HeaderPolicy,
        timeout: Duration,
        dev_mode: bool,
    ) -> Self {
        Self {
            ledger,
            client,
            headers,
            timeout,
            dev_mode,
        }
    }

    pub async fn execute(
        &self,
        caller: &Identity,
        request_id: i64,
        destination: &str,
    ) -> Result<i64, AppError> {
        let request = match self.ledger.get_request(request_id).await {
            Ok(request) => request,
            Err(err) if err.is_not_found() => {
                return Err(AppError::InvalidRequestReference(request_id))
            }
            Err(err) => return Err(err),
        };

        if !owns(&request, caller) {
            tracing::warn!(request_id, identity_id = caller.id, "replay ownership mismatch");
            return Err(AppError::Unauthorized);
        }

        let destination = destination.trim();
        if destination.is_empty() {
            return Err(AppError::InvalidDestination("Missing endpoint".to_owned()));
        }
        let url = parse_destination(destination)?;
        guard::check_destination(&url, self.dev_mode)?;

        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|_| {
            AppError::Internal("stored request contains invalid HTTP method".to_owned())
        })?;

        tracing::info!(
            request_id,
            identity_id = caller.id,
            method = %method,
            destination = %url,
            "starting replay"
        );

        let started_at = Utc::now();
        let outcome = self.send(method, url, &request).await;
        let ended_at = Utc::now();

        if let ReplayOutcome::Failed { error_message } = &outcome {
            tracing::warn!(request_id, error = %error_message, "replay failed");
        }

        let replay_id = self
            .ledger
            .save_replay(NewReplay {
                request_id,
                destination: destination.to_owned(),
                outcome,
                started_at,
                ended_at,
            })
            .await?;

        tracing::info!(request_id, replay_id, "replay recorded");
        Ok(replay_id)
    }

    async fn send(
        &self,
        method: reqwest::Method,
        url: Url,
        request: &CapturedRequest,
    ) -> ReplayOutcome {
        let mut outbound = self
            .client
            .request(method, url)
            .timeout(self.timeout)
            .body(request.body.clone());

        for header in &request.headers {
            if self.headers.is_stripped(&header.key) {
                continue;
            }
            outbound = outbound.header(header.key.as_str(), header.value.as_str());
        }

        let response = match outbound.send().await {
            Ok(response) => response,
            Err(err) => {
                return ReplayOutcome::Failed {
                    error_message: format!("Couldn't send request, error {err}"),
                }
            }
        };

        let status_code = response.status().as_u16();
        let response_headers = collect_headers(response.headers());

        match response.bytes().await {
            Ok(response_body) => ReplayOutcome::Completed {
                status_code,
                response_body: response_body.to_vec(),
                response_headers,
            },
            Err(err) => ReplayOutcome::Failed {
                error_message: format!("Unable to read response body, error {err}"),
            },
        }
    }
}

fn owns(request: &CapturedRequest, caller: &Identity) -> bool {
    bool::from(
        request
            .owner_token
            .as_bytes()
            .ct_eq(caller.token.as_bytes()),
    )
}

fn parse_destination(destination: &str) -> Result<Url, AppError> {
    let url = Url::parse(destination)
        .map_err(|err| AppError::InvalidDestination(format!("{destination}: {err}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(AppError::InvalidDestination(format!(
            "unsupported scheme {scheme}"
        ))),
    }
}

fn collect_headers(headers: &reqwest::header::HeaderMap) -> Vec<Header> {
    let mut collected: Vec<Header> = Vec::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        match collected
            .iter_mut()
            .find(|header| header.key == name.as_str())
        {
            Some(existing) => {
                existing.value.push(',');
                existing.value.push_str(&value);
            }
            None => collected.push(Header::new(name.as_str(), value)),
        }
    }
    collected
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::{
        http::{HeaderMap, StatusCode},
        routing::any,
        Router,
    };

    use crate::db::memory::MemoryLedger;
    use crate::domain::NewCapturedRequest;

    use super::*;

    struct Fixture {
        ledger: Arc<dyn Ledger>,
        owner: Identity,
        request_id: i64,
    }

    fn identity(id: i64, token: &str) -> Identity {
        Identity {
            id,
            token: token.to_owned(),
            created_at: Utc::now(),
            user_agent: None,
            source_address: None,
        }
    }

    async fn fixture() -> Fixture {
        let ledger: Arc<dyn Ledger> = Arc::new(MemoryLedger::default());
        let request_id = ledger
            .save_request(NewCapturedRequest {
                owner_token: "abc".to_owned(),
                method: "POST".to_owned(),
                target_url: "/x".to_owned(),
                body: br#"{"a":1}"#.to_vec(),
                headers: vec![Header::new("foo", "bar")],
            })
            .await
            .unwrap();
        Fixture {
            ledger,
            owner: identity(1, "abc"),
            request_id,
        }
    }

    fn engine(ledger: &Arc<dyn Ledger>, dev_mode: bool) -> ReplayEngine {
        engine_with(
            ledger,
            client_builder(dev_mode).no_proxy().build().unwrap(),
            HeaderPolicy::new("x-real-ip"),
            dev_mode,
        )
    }

    fn engine_with(
        ledger: &Arc<dyn Ledger>,
        client: reqwest::Client,
        headers: HeaderPolicy,
        dev_mode: bool,
    ) -> ReplayEngine {
        ReplayEngine::new(
            Arc::clone(ledger),
            client,
            headers,
            DEFAULT_REPLAY_TIMEOUT,
            dev_mode,
        )
    }

    async fn serve(router: Router) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    async fn only_replay(ledger: &Arc<dyn Ledger>) -> crate::domain::Replay {
        let mut listed = ledger.list_requests_for_owner("abc", 50).await.unwrap();
        listed.remove(0).replays.remove(0)
    }

    async fn replay_count(ledger: &Arc<dyn Ledger>) -> i64 {
        ledger
            .count_replays_since(Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn unknown_request_is_invalid_reference() {
        let fx = fixture().await;
        let err = engine(&fx.ledger, false)
            .execute(&fx.owner, fx.request_id + 100, "https://example.test")
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::InvalidRequestReference(_)));
        assert_eq!(replay_count(&fx.ledger).await, 0);
    }

    #[tokio::test]
    async fn other_callers_are_unauthorized() {
        let fx = fixture().await;
        let engine = engine(&fx.ledger, false);

        for token in ["abd", "ab", "abcd", ""] {
            let err = engine
                .execute(&identity(2, token), fx.request_id, "https://example.test")
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::Unauthorized), "{token}");
        }
        assert_eq!(replay_count(&fx.ledger).await, 0);
    }

    #[tokio::test]
    async fn empty_destination_is_invalid() {
        let fx = fixture().await;
        let err = engine(&fx.ledger, false)
            .execute(&fx.owner, fx.request_id, "  ")
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::InvalidDestination(_)));
    }

    #[tokio::test]
    async fn non_http_destination_is_invalid() {
        let fx = fixture().await;
        let err = engine(&fx.ledger, false)
            .execute(&fx.owner, fx.request_id, "file:///etc/passwd")
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::InvalidDestination(_)));
    }

    #[tokio::test]
    async fn loopback_destination_is_unsafe_outside_dev_mode() {
        let fx = fixture().await;
        let err = engine(&fx.ledger, false)
            .execute(&fx.owner, fx.request_id, "http://localhost:9/hook")
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::UnsafeDestination(_)));
        assert_eq!(replay_count(&fx.ledger).await, 0);
    }

    #[tokio::test]
    async fn completed_replay_records_response() {
        let seen = Arc::new(Mutex::new((String::new(), Vec::<u8>::new(), HeaderMap::new())));
        let seen_clone = Arc::clone(&seen);
        let downstream = Router::new().route(
            "/*path",
            any(
                move |method: axum::http::Method, headers: HeaderMap, body: axum::body::Bytes| {
                    let seen = Arc::clone(&seen_clone);
                    async move {
                        *seen.lock().unwrap() = (method.to_string(), body.to_vec(), headers);
                        (StatusCode::CREATED, [("x-downstream", "yes")], "accepted")
                    }
                },
            ),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, downstream).await.unwrap();
        });

        let fx = fixture().await;
        let replay_id = engine(&fx.ledger, true)
            .execute(&fx.owner, fx.request_id, &format!("http://{addr}/y"))
            .await
            .unwrap();

        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.0, "POST");
            assert_eq!(seen.1, br#"{"a":1}"#);
            assert_eq!(seen.2.get("foo").unwrap(), "bar");
        }

        let listed = fx.ledger.list_requests_for_owner("abc", 50).await.unwrap();
        let replay = &listed[0].replays[0];
        assert_eq!(replay.id, replay_id);
        assert_eq!(replay.request_id, fx.request_id);
        match &replay.outcome {
            ReplayOutcome::Completed {
                status_code,
                response_body,
                response_headers,
            } => {
                assert_eq!(*status_code, 201);
                assert_eq!(response_body, b"accepted");
                assert!(response_headers.contains(&Header::new("x-downstream", "yes")));
            }
            other => panic!("expected completed replay, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_failure_is_recorded_not_raised() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let fx = fixture().await;
        let replay_id = engine(&fx.ledger, true)
            .execute(&fx.owner, fx.request_id, &format!("http://{addr}/y"))
            .await
            .unwrap();

        let listed = fx.ledger.list_requests_for_owner("abc", 50).await.unwrap();
        let replay = &listed[0].replays[0];
        assert_eq!(replay.id, replay_id);
        assert!(matches!(
            &replay.outcome,
            ReplayOutcome::Failed { error_message } if !error_message.is_empty()
        ));
        assert!(replay.ended_at >= replay.started_at);
    }

    #[tokio::test]
    async fn binary_response_body_is_kept_byte_for_byte() {
        let addr = serve(Router::new().route(
            "/*path",
            any(|| async { (StatusCode::OK, b"bin\0ary\xff".to_vec()) }),
        ))
        .await;

        let fx = fixture().await;
        engine(&fx.ledger, true)
            .execute(&fx.owner, fx.request_id, &format!("http://{addr}/y"))
            .await
            .unwrap();

        match only_replay(&fx.ledger).await.outcome {
            ReplayOutcome::Completed { response_body, .. } => {
                assert_eq!(response_body, b"bin\0ary\xff");
            }
            other => panic!("expected completed replay, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn configured_client_address_header_is_not_forwarded() {
        let seen = Arc::new(Mutex::new(HeaderMap::new()));
        let seen_clone = Arc::clone(&seen);
        let addr = serve(Router::new().route(
            "/*path",
            any(move |headers: HeaderMap| {
                let seen = Arc::clone(&seen_clone);
                async move {
                    *seen.lock().unwrap() = headers;
                    StatusCode::NO_CONTENT
                }
            }),
        ))
        .await;

        let ledger: Arc<dyn Ledger> = Arc::new(MemoryLedger::default());
        let request_id = ledger
            .save_request(NewCapturedRequest {
                owner_token: "abc".to_owned(),
                method: "POST".to_owned(),
                target_url: "/x".to_owned(),
                body: Vec::new(),
                headers: vec![
                    Header::new("cf-connecting-ip", "198.51.100.7"),
                    Header::new("foo", "bar"),
                ],
            })
            .await
            .unwrap();

        engine_with(
            &ledger,
            client_builder(true).no_proxy().build().unwrap(),
            HeaderPolicy::new("cf-connecting-ip"),
            true,
        )
        .execute(&identity(1, "abc"), request_id, &format!("http://{addr}/y"))
        .await
        .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.get("foo").unwrap(), "bar");
        assert!(seen.get("cf-connecting-ip").is_none());
    }

    #[tokio::test]
    async fn redirect_to_loopback_is_not_followed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let landing = format!("http://localhost:{}/landing", addr.port());
        let landed = Arc::new(Mutex::new(false));
        let landed_clone = Arc::clone(&landed);
        let downstream = Router::new()
            .route(
                "/start",
                any(move || {
                    let landing = landing.clone();
                    async move { axum::response::Redirect::temporary(&landing) }
                }),
            )
            .route(
                "/landing",
                any(move || {
                    let landed = Arc::clone(&landed_clone);
                    async move {
                        *landed.lock().unwrap() = true;
                        StatusCode::OK
                    }
                }),
            );
        tokio::spawn(async move {
            axum::serve(listener, downstream).await.unwrap();
        });

        // A public-looking name pinned to the local listener.
        let client = client_builder(false)
            .no_proxy()
            .resolve("hooks.example.test", addr)
            .build()
            .unwrap();

        let fx = fixture().await;
        let replay_id = engine_with(&fx.ledger, client, HeaderPolicy::new("x-real-ip"), false)
            .execute(
                &fx.owner,
                fx.request_id,
                &format!("http://hooks.example.test:{}/start", addr.port()),
            )
            .await
            .unwrap();

        let replay = only_replay(&fx.ledger).await;
        assert_eq!(replay.id, replay_id);
        assert!(matches!(replay.outcome, ReplayOutcome::Failed { .. }));
        assert!(!*landed.lock().unwrap());
    }
}
