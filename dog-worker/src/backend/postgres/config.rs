use std::time::Duration;

use rand::Rng;
use sqlx::postgres::{PgConnectOptions, PgSslMode};

use crate::config::{env_or, env_parse};
use crate::error::WorkerResult;

/// Connection settings for [`PgProcessor`](super::PgProcessor)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub username: String,
    pub password: String,

    /// Upper bound on pooled connections
    pub max_open_conns: u32,
    /// Connections kept open while idle
    pub max_idle_conns: u32,
    pub conn_max_idle_time: Duration,
    pub conn_max_lifetime: Duration,
    /// Random extra lifetime so connections do not all recycle at once
    pub conn_max_lifetime_jitter: Duration,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            name: "postgres".to_string(),
            username: "root".to_string(),
            password: String::new(),
            max_open_conns: 10,
            max_idle_conns: 4,
            conn_max_idle_time: Duration::from_secs(5 * 60),
            conn_max_lifetime: Duration::from_secs(5 * 60),
            conn_max_lifetime_jitter: Duration::from_secs(2 * 60),
        }
    }
}

impl PgConfig {
    /// Read `PGQ_HOST`, `PGQ_PORT`, `PGQ_NAME`, `PGQ_USERNAME`,
    /// `PGQ_PASSWORD`, `PGQ_MAX_OPEN_CONNS` and `PGQ_MAX_IDLE_CONNS`.
    pub fn from_env() -> WorkerResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            host: env_or("PGQ_HOST", &defaults.host),
            port: env_parse("PGQ_PORT", defaults.port)?,
            name: env_or("PGQ_NAME", &defaults.name),
            username: env_or("PGQ_USERNAME", &defaults.username),
            password: env_or("PGQ_PASSWORD", &defaults.password),
            max_open_conns: env_parse("PGQ_MAX_OPEN_CONNS", defaults.max_open_conns)?,
            max_idle_conns: env_parse("PGQ_MAX_IDLE_CONNS", defaults.max_idle_conns)?,
            ..defaults
        })
    }

    pub fn connection_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode=disable",
            self.username, self.password, self.host, self.port, self.name
        )
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.name)
            .username(&self.username)
            .password(&self.password)
            .ssl_mode(PgSslMode::Disable)
    }

    /// `conn_max_lifetime` plus a random share of the jitter
    pub fn conn_max_lifetime_with_jitter(&self) -> Duration {
        let jitter_ms = self.conn_max_lifetime_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.conn_max_lifetime;
        }
        self.conn_max_lifetime + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    }
}
