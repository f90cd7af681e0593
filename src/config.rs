// src/config.rs

use std::env;
use std::str::FromStr;
use dotenvy::dotenv;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    pub rust_log: String,
    pub port: u16,
    /// How often the stale-session sweep runs.
    pub sweep_interval_secs: u64,
    /// Sessions still `IN_PROGRESS` this long after starting are force-expired.
    pub stale_session_hours: i64,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .expect("DATABASE_URL must be set");

        let jwt_secret = env::var("JWT_SECRET")
            .expect("JWT_SECRET must be set");

        let rust_log = env::var("RUST_LOG")
            .unwrap_or_else(|_| "info".to_string());

        let port = parse_or("PORT", 3000);
        let sweep_interval_secs = parse_or("SWEEP_INTERVAL_SECS", 60 * 60);
        let stale_session_hours = parse_or("STALE_SESSION_HOURS", 24);

        Self {
            database_url,
            jwt_secret,
            rust_log,
            port,
            sweep_interval_secs,
            stale_session_hours,
        }
    }
}

/// Reads an optional numeric variable, falling back to `default` when unset or invalid.
fn parse_or<T: FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("{} value '{}' is not valid. Defaulting to {}.", key, raw, default);
                default
            }
        },
        Err(_) => default,
    }
}
