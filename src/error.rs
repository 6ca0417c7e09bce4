//! Error types for the Print Herald library.
//!
//! Each subsystem reports its own error enum; [`Error`] wraps all of them so
//! setup code can propagate any of them with `?`.

use thiserror::Error;

/// Umbrella error type for Print Herald operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A chat transport request failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// An image could not be fetched or processed.
    #[error("image error: {0}")]
    Image(#[from] ImageError),

    /// The printer backend connection failed.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
}

/// Errors related to loading and validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML or does not match the schema.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field holds a value that cannot be used.
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// A URL field could not be parsed.
    #[error("invalid URL '{value}' for '{field}': {source}")]
    InvalidUrl {
        field: String,
        value: String,
        #[source]
        source: url::ParseError,
    },
}

/// Errors returned by a chat transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The HTTP request itself failed.
    #[error("request '{method}' failed: {source}")]
    Request {
        method: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// The chat API answered but refused the call.
    #[error("'{method}' rejected by chat API: {description}")]
    Rejected {
        method: &'static str,
        description: String,
    },
}

/// Errors specific to image fetching and processing.
#[derive(Debug, Error)]
pub enum ImageError {
    /// The HTTP request failed.
    #[error("failed to download image from '{url}': {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with a non-success status.
    #[error("image request to '{url}' returned HTTP {status}")]
    Status { url: String, status: u16 },

    /// The image bytes could not be decoded or re-encoded.
    #[error("failed to process image: {0}")]
    Codec(#[from] image::ImageError),
}

/// Errors raised while talking to the printer backend.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The websocket handshake or stream failed.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The backend closed the stream.
    #[error("connection closed by backend")]
    Closed,
}
