use std::sync::Arc;

use axum::http::HeaderMap;

use crate::{
    db::Ledger,
    domain::{Header, NewCapturedRequest},
    errors::AppError,
    identity::IdentityManager,
};

/// Headers produced by transport negotiation or connection handling. They
/// describe the hop that delivered the request, not the request itself.
const TRANSPORT_HEADERS: [&str; 10] = [
    "accept-encoding",
    "connection",
    "content-encoding",
    "content-length",
    "host",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers a fronting proxy adds to carry the real client address.
const CLIENT_ADDRESS_HEADERS: [&str; 3] = ["forwarded", "x-forwarded-for", "x-real-ip"];

/// Whether a header is one of the fixed transport or proxy headers.
pub fn is_stripped_header(name: &str) -> bool {
    TRANSPORT_HEADERS
        .iter()
        .chain(CLIENT_ADDRESS_HEADERS.iter())
        .any(|stripped| name.eq_ignore_ascii_case(stripped))
}

/// Decides which headers are kept out of the stored, replayable header set:
/// the fixed list plus whatever header the fronting proxy is configured to
/// carry the client address in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderPolicy {
    client_address_header: String,
}

impl HeaderPolicy {
    pub fn new(client_address_header: impl Into<String>) -> Self {
        Self {
            client_address_header: client_address_header.into(),
        }
    }

    pub fn is_stripped(&self, name: &str) -> bool {
        is_stripped_header(name) || name.eq_ignore_ascii_case(&self.client_address_header)
    }

    /// Flattens a header map into the stored form. Repeated headers collapse
    /// into one comma-joined entry at the position of their first occurrence.
    pub fn normalize(&self, headers: &HeaderMap) -> Vec<Header> {
        let mut normalized: Vec<Header> = Vec::new();
        for (name, value) in headers {
            if self.is_stripped(name.as_str()) {
                continue;
            }
            let value = String::from_utf8_lossy(value.as_bytes());
            match normalized
                .iter_mut()
                .find(|header| header.key == name.as_str())
            {
                Some(existing) => {
                    existing.value.push(',');
                    existing.value.push_str(&value);
                }
                None => normalized.push(Header::new(name.as_str(), value)),
            }
        }
        normalized
    }
}

#[derive(Debug, Clone)]
pub struct CaptureInput {
    pub target_ident: String,
    pub method: String,
    pub url: String,
    pub body: Vec<u8>,
    pub headers: HeaderMap,
}

#[derive(Clone)]
pub struct CaptureIngestor {
    identities: IdentityManager,
    ledger: Arc<dyn Ledger>,
    headers: HeaderPolicy,
}

impl CaptureIngestor {
    pub fn new(
        identities: IdentityManager,
        ledger: Arc<dyn Ledger>,
        headers: HeaderPolicy,
    ) -> Self {
        Self {
            identities,
            ledger,
            headers,
        }
    }

    pub async fn capture(&self, input: CaptureInput) -> Result<i64, AppError> {
        let owner = match self.identities.resolve_by_token(&input.target_ident).await {
            Ok(identity) => identity,
            Err(err) if err.is_not_found() => {
                return Err(AppError::InvalidTarget(input.target_ident))
            }
            Err(err) => return Err(err),
        };

        let id = self
            .ledger
            .save_request(NewCapturedRequest {
                owner_token: owner.token,
                method: input.method,
                target_url: input.url.clone(),
                body: input.body,
                headers: self.headers.normalize(&input.headers),
            })
            .await?;

        tracing::info!(request_id = id, url = %input.url, "captured request");
        Ok(id)
    }
}
