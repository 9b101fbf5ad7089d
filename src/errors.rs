//! Error types for rpkilog
//!
//! This module defines structured error types using `thiserror` for better error handling
//! and debugging. Each error type provides specific context about what failed and why.

use thiserror::Error;

/// Main error type for rpkilog operations
#[derive(Error, Debug)]
pub enum RpkilogError {
    /// ASN is out of range or not parseable from its upstream rendering
    #[error("Invalid asn '{input}'")]
    InvalidAsn { input: String },

    /// maxLength is below the prefix length or above the address width
    #[error("Invalid maxLength {max_length} for prefix {prefix}")]
    InvalidMaxLength { max_length: i64, prefix: String },

    /// Prefix is not a valid IPv4/IPv6 network
    #[error("Invalid prefix '{input}': {reason}")]
    InvalidPrefix { input: String, reason: String },

    /// A required field is absent from an upstream record
    #[error("Missing required field '{field}' in upstream record")]
    MissingRequired { field: &'static str },

    /// Upstream record matches neither known schema variant
    #[error("Unrecognized upstream schema: {details}")]
    UnrecognizedSchema { details: String },

    /// A bucket key or filename does not match the timestamp grammar
    #[error("Key '{key}' does not match the expected timestamp grammar")]
    UnparsableKey { key: String },

    /// Error when external data sources are unavailable or return invalid data
    #[error("Failed to load data from {data_source}: {details}")]
    DataSourceError {
        data_source: String,
        details: String,
    },

    /// Search-index operation failed (after retries, where applicable)
    #[error("Search index error: {details}")]
    IndexError { details: String },

    /// The diff merge loop failed to advance a cursor
    #[error("Diff merge stalled: neither cursor advanced with {remaining_old} old and {remaining_new} new records remaining")]
    ProgressStall {
        remaining_old: usize,
        remaining_new: usize,
    },

    /// Network or I/O related errors
    #[error("Network/IO error: {0}")]
    NetworkError(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Date/time parsing errors
    #[error("Date/time parsing error: {0}")]
    ChronoError(#[from] chrono::ParseError),

    /// IP network parsing errors
    #[error("IP network parsing error: {0}")]
    IpNetError(#[from] ipnet::AddrParseError),

    /// OneIO errors (file/network operations)
    #[error("OneIO error: {0}")]
    OneIoError(#[from] oneio::OneIoError),

    /// HTTP errors from the search-index client
    #[error("HTTP error: {0}")]
    HttpError(#[from] Box<ureq::Error>),

    /// Object store (S3) errors
    #[error("Object store error: {0}")]
    StoreError(#[from] Box<s3::error::S3Error>),

    /// Parsing errors (int, float, etc.)
    #[error("Parsing error: {0}")]
    ParseIntError(#[from] std::num::ParseIntError),

    /// Generic error for cases not covered by specific error types
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RpkilogError {
    /// Create a data source error
    pub fn data_source_error(source: impl Into<String>, details: impl Into<String>) -> Self {
        Self::DataSourceError {
            data_source: source.into(),
            details: details.into(),
        }
    }

    /// Create a search-index error
    pub fn index_error(details: impl Into<String>) -> Self {
        Self::IndexError {
            details: details.into(),
        }
    }

    /// Create an invalid prefix error
    pub fn invalid_prefix(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPrefix {
            input: input.into(),
            reason: reason.into(),
        }
    }
}

impl From<ureq::Error> for RpkilogError {
    fn from(err: ureq::Error) -> Self {
        Self::HttpError(Box::new(err))
    }
}

impl From<s3::error::S3Error> for RpkilogError {
    fn from(err: s3::error::S3Error) -> Self {
        Self::StoreError(Box::new(err))
    }
}

/// Result type alias for rpkilog operations
pub type Result<T> = std::result::Result<T, RpkilogError>;

/// Data source constants for consistent error messages
pub mod data_sources {
    pub const SNAPSHOT: &str = "snapshot archive";
    pub const SUMMARY: &str = "summary artifact";
    pub const DIFF: &str = "diff artifact";
    pub const OBJECT_STORE: &str = "object store";
}
