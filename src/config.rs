use anyhow::{Context, Result};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// `None` runs against the in-memory store.
    pub database_url: Option<String>,
    pub port: u16,
    /// Public origin used in certificate verification links.
    pub base_url: String,
    pub cert_prefix: String,
    pub program_passing_score: f64,
    pub program_title: String,
    pub issuer_name: String,
    pub render_service_url: Option<String>,
    /// Connect and whole-request limit for render service calls.
    pub render_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            port: 8081,
            base_url: "http://127.0.0.1:8081".into(),
            cert_prefix: "COOP".into(),
            program_passing_score: 80.0,
            program_title: "Risk Management Program".into(),
            issuer_name: "Risk Management & Compliance".into(),
            render_service_url: None,
            render_timeout_secs: 10,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let d = Config::default();
        let non_empty = |key: &str| get(key).filter(|v| !v.trim().is_empty());
        Ok(Self {
            database_url: non_empty("DATABASE_URL"),
            port: parse(&get, "PORT")?.unwrap_or(d.port),
            base_url: non_empty("BASE_URL").unwrap_or(d.base_url),
            cert_prefix: non_empty("CERT_PREFIX").unwrap_or(d.cert_prefix),
            program_passing_score: parse(&get, "PROGRAM_PASSING_SCORE")?
                .unwrap_or(d.program_passing_score),
            program_title: non_empty("PROGRAM_TITLE").unwrap_or(d.program_title),
            issuer_name: non_empty("ISSUER_NAME").unwrap_or(d.issuer_name),
            render_service_url: non_empty("RENDER_SERVICE_URL"),
            render_timeout_secs: parse(&get, "RENDER_TIMEOUT_SECS")?.unwrap_or(d.render_timeout_secs),
        })
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs)
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    get(key)
        .map(|v| v.trim().parse::<T>().with_context(|| format!("invalid {key}: {v:?}")))
        .transpose()
}
