use std::path::PathBuf;

use anyhow::Context;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8000";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://aronachat.db";
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

/// Runtime settings, read from the process environment (and `.env` when present).
#[derive(Debug, Clone)]
pub struct Config {
    /// `APP_HOST`
    pub listen_addr: String,
    /// `API_URL`, prefixed to `/images/<file>` when publishing an image reference.
    pub public_url: String,
    /// `DATABASE_URL`
    pub database_url: String,
    /// `IMAGE_DIR`
    pub image_dir: PathBuf,
    /// `PUBLIC_DIR`
    pub public_dir: PathBuf,
    /// `FEED_CAPACITY`
    pub feed_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_owned(),
            public_url: String::new(),
            database_url: DEFAULT_DATABASE_URL.to_owned(),
            image_dir: PathBuf::from("images"),
            public_dir: PathBuf::from("public"),
            feed_capacity: DEFAULT_FEED_CAPACITY,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let feed_capacity = match var("FEED_CAPACITY") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|capacity| *capacity > 0)
                .with_context(|| format!("FEED_CAPACITY must be a positive integer, got {raw:?}"))?,
            None => defaults.feed_capacity,
        };

        Ok(Self {
            listen_addr: var("APP_HOST")
                .map(|addr| normalize_listen_addr(&addr))
                .unwrap_or(defaults.listen_addr),
            public_url: var("API_URL")
                .map(|url| url.trim_end_matches('/').to_owned())
                .unwrap_or(defaults.public_url),
            database_url: var("DATABASE_URL").unwrap_or(defaults.database_url),
            image_dir: var("IMAGE_DIR").map(PathBuf::from).unwrap_or(defaults.image_dir),
            public_dir: var("PUBLIC_DIR").map(PathBuf::from).unwrap_or(defaults.public_dir),
            feed_capacity,
        })
    }
}

// ":8000" means every interface
fn normalize_listen_addr(addr: &str) -> String {
    let addr = addr.trim();
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => addr.to_owned(),
    }
}
