use thiserror::Error;

/// Errors surfaced while building a client or normalizing public-API input.
///
/// Ingestion and flag-query methods never return these directly: the
/// client catches them, reports through the configured `on_error`
/// callback, and returns `false` or `None` to the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// A required field on a public-API input was missing or empty.
    #[error("{0}")]
    Validation(String),

    /// The client was constructed with an unusable configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A value could not be serialized into the wire format.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    pub(crate) fn missing(field: &str) -> Self {
        Error::Validation(format!("{field} must be given"))
    }
}
