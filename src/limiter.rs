//! Global replay rate limiting.
//!
//! Counts come from the ledger, so the limit applies to the outbound capacity
//! of the whole service rather than to any single identity. The check is not
//! serialized against concurrent replay inserts; a burst of parallel replays
//! can briefly overshoot a window.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};

use crate::{db::Ledger, errors::AppError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    pub lookback: Duration,
    pub allowed: i64,
}

impl RateWindow {
    pub const fn new(lookback_secs: u64, allowed: i64) -> Self {
        Self {
            lookback: Duration::from_secs(lookback_secs),
            allowed,
        }
    }
}

/// Checked shortest first, so bursts are reported before slower abuse.
pub const DEFAULT_WINDOWS: [RateWindow; 4] = [
    RateWindow::new(10, 5),
    RateWindow::new(60, 30),
    RateWindow::new(60 * 60, 1_000),
    RateWindow::new(24 * 60 * 60, 10_000),
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Limit {window_index} exceeded with {count} replays ({allowed} allowed in {}s)", .window.as_secs())]
pub struct RateLimitExceeded {
    pub window_index: usize,
    pub window: Duration,
    pub count: i64,
    pub allowed: i64,
}

#[derive(Clone)]
pub struct RateLimiter {
    ledger: Arc<dyn Ledger>,
    windows: Vec<RateWindow>,
}

impl RateLimiter {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self::with_windows(ledger, DEFAULT_WINDOWS.to_vec())
    }

    pub fn with_windows(ledger: Arc<dyn Ledger>, mut windows: Vec<RateWindow>) -> Self {
        windows.sort_by_key(|window| window.lookback);
        Self { ledger, windows }
    }

    pub fn windows(&self) -> &[RateWindow] {
        &self.windows
    }

    pub async fn check(&self) -> Result<(), AppError> {
        self.check_at(Utc::now()).await
    }

    /// A window at exactly its allowance still admits the replay.
    pub async fn check_at(&self, now: DateTime<Utc>) -> Result<(), AppError> {
        for (window_index, window) in self.windows.iter().enumerate() {
            let lookback = chrono::Duration::from_std(window.lookback)
                .map_err(|err| AppError::Internal(format!("rate window out of range: {err}")))?;
            let count = self.ledger.count_replays_since(now - lookback).await?;

            if count > window.allowed {
                return Err(RateLimitExceeded {
                    window_index,
                    window: window.lookback,
                    count,
                    allowed: window.allowed,
                }
                .into());
            }
        }
        Ok(())
    }
}
