//! Anonymous caller identities.
//!
//! There is no account system: a caller is whoever holds an identity token.
//! A caller that presents a token nobody issued is treated as first contact
//! and silently gets a fresh identity, so a lost or stale cookie never locks
//! anyone out.

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{rngs::OsRng, RngCore};

use crate::{
    db::Ledger,
    domain::{Identity, NewIdentity},
    errors::AppError,
};

/// Bytes of randomness behind each identity token.
pub const TOKEN_BYTES: usize = 16;

/// Lifetime of the credential handed back to the caller, in seconds.
pub const CREDENTIAL_MAX_AGE_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// What the HTTP layer knows about the caller of one request.
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    pub token: Option<String>,
    pub user_agent: Option<String>,
    pub source_address: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    pub identity: Identity,
    /// Set when the caller's token was unknown and a new identity was minted;
    /// the new token has to be handed back to the caller.
    pub registered: bool,
}

#[derive(Clone)]
pub struct IdentityManager {
    ledger: Arc<dyn Ledger>,
}

impl IdentityManager {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    pub async fn resolve_by_token(&self, token: &str) -> Result<Identity, AppError> {
        self.ledger.get_identity_by_token(token).await
    }

    pub async fn resolve_from_caller(
        &self,
        caller: &CallerContext,
    ) -> Result<ResolvedIdentity, AppError> {
        let token = caller
            .token
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or(AppError::Unauthenticated)?;

        match self.ledger.get_identity_by_token(token).await {
            Ok(identity) => Ok(ResolvedIdentity {
                identity,
                registered: false,
            }),
            Err(err) if err.is_not_found() => {
                tracing::info!("unknown identity token presented, registering new identity");
                let identity = self
                    .register_anonymous(caller.user_agent.clone(), caller.source_address.clone())
                    .await?;
                Ok(ResolvedIdentity {
                    identity,
                    registered: true,
                })
            }
            Err(err) => Err(err),
        }
    }

    pub async fn register_anonymous(
        &self,
        user_agent: Option<String>,
        source_address: Option<String>,
    ) -> Result<Identity, AppError> {
        let identity = self
            .ledger
            .create_identity(NewIdentity {
                token: generate_token()?,
                user_agent,
                source_address,
            })
            .await?;

        tracing::info!(
            identity_id = identity.id,
            source_address = identity.source_address.as_deref().unwrap_or("-"),
            "registered anonymous identity"
        );
        Ok(identity)
    }
}

pub fn generate_token() -> Result<String, AppError> {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| AppError::Internal(format!("failed to generate identity token: {err}")))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}
