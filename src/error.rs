//! Error taxonomy for the price engine.
//!
//! Input, fetch and extraction failures are recoverable per item; repository
//! failures abort the current item only; configuration failures are fatal at
//! startup.

use thiserror::Error;

/// A pasted product URL that cannot be tracked.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InputError {
    #[error("URL is empty")]
    Empty,

    #[error("malformed URL: {0}")]
    Malformed(String),

    #[error("URL is not an amazon.sa product link: {0}")]
    ForeignHost(String),

    #[error("could not expand short link {url}: {reason}")]
    ShortLink { url: String, reason: String },

    #[error("target price must be a positive number, got {0}")]
    InvalidTargetPrice(f64),
}

/// Failure of a single outbound request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("HTTP status {status}")]
    Http { status: u16 },

    #[error("blocked by marketplace: {0}")]
    Blocked(String),
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Timeout => "timeout",
            Self::Http { .. } => "http",
            Self::Blocked(_) => "blocked",
        }
    }

    /// Classify an HTTP status the way the marketplace uses it.
    pub fn from_status(status: u16) -> Self {
        match status {
            429 | 503 => Self::Blocked(format!("status {status}")),
            _ => Self::Http { status },
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16())
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Failure to turn a page into a valid snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("product name not found")]
    MissingName,

    #[error("no parseable positive price found")]
    MissingPrice,

    #[error("all {attempts} extraction strategies failed")]
    Exhausted { attempts: usize },
}

/// Outcome of walking the strategy chain for one product URL.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScrapeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Extract(#[from] ExtractError),
}

impl ScrapeError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fetch(err) => err.kind(),
            Self::Extract(_) => "extract",
        }
    }
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("cannot load deals configuration from {path}: {reason}")]
    DealsFile { path: String, reason: String },
}

/// Errors surfaced to a caller that asks to start tracking a URL.
#[derive(Debug, Error)]
pub enum TrackError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}
