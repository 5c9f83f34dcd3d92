use std::{env, error::Error, time::Duration};

use crate::{db::DEFAULT_MAX_CONNECTIONS, replay::DEFAULT_REPLAY_TIMEOUT};

/// Knobs the request handlers and replay engine read at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOptions {
    pub dev_mode: bool,
    pub replay_timeout: Duration,
    pub max_webhook_size_bytes: usize,
    /// Header a trusted fronting proxy sets to the real client address.
    pub client_address_header: String,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            dev_mode: false,
            replay_timeout: DEFAULT_REPLAY_TIMEOUT,
            max_webhook_size_bytes: DEFAULT_MAX_WEBHOOK_SIZE_BYTES,
            client_address_header: DEFAULT_CLIENT_ADDRESS_HEADER.to_owned(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub bind_addr: String,
    pub database_max_connections: u32,
    pub service: ServiceOptions,
}

const DEFAULT_MAX_WEBHOOK_SIZE_BYTES: usize = 5_242_880;
const DEFAULT_CLIENT_ADDRESS_HEADER: &str = "x-real-ip";

impl AppConfig {
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        let database_url = env::var("DATABASE_URL")?;
        let bind_addr = env::var("BIND_ADDR").or_else(|err| match err {
            env::VarError::NotPresent => Ok("0.0.0.0:5000".to_owned()),
            err => Err(err),
        })?;
        let database_max_connections = match env::var("DATABASE_MAX_CONNECTIONS") {
            Ok(raw) => raw.parse::<u32>()?,
            Err(env::VarError::NotPresent) => DEFAULT_MAX_CONNECTIONS,
            Err(err) => return Err(Box::new(err)),
        };
        let dev_mode = match env::var("DEV_MODE") {
            Ok(raw) => parse_flag(&raw),
            // Older deployments toggle development mode with `dev=true`.
            Err(env::VarError::NotPresent) => env::var("dev")
                .map(|raw| parse_flag(&raw))
                .unwrap_or(false),
            Err(err) => return Err(Box::new(err)),
        };
        let max_webhook_size_bytes = match env::var("MAX_WEBHOOK_SIZE_BYTES") {
            Ok(raw) => raw.parse::<usize>()?,
            Err(env::VarError::NotPresent) => DEFAULT_MAX_WEBHOOK_SIZE_BYTES,
            Err(err) => return Err(Box::new(err)),
        };
        let replay_timeout = match env::var("REPLAY_TIMEOUT_MS") {
            Ok(raw) => Duration::from_millis(raw.parse::<u64>()?),
            Err(env::VarError::NotPresent) => DEFAULT_REPLAY_TIMEOUT,
            Err(err) => return Err(Box::new(err)),
        };
        let client_address_header = match env::var("CLIENT_ADDRESS_HEADER") {
            Ok(raw) => raw.trim().to_ascii_lowercase(),
            Err(env::VarError::NotPresent) => DEFAULT_CLIENT_ADDRESS_HEADER.to_owned(),
            Err(err) => return Err(Box::new(err)),
        };

        Ok(Self {
            database_url,
            bind_addr,
            database_max_connections,
            service: ServiceOptions {
                dev_mode,
                replay_timeout,
                max_webhook_size_bytes,
                client_address_header,
            },
        })
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}
