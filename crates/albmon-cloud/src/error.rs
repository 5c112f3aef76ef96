/// Errors that can occur when talking to the load-balancer directory or
/// the telemetry API, or while setting up a client for them.
///
/// # Examples
///
/// ```rust
/// use albmon_cloud::error::AlbError;
///
/// let err = AlbError::ConfigError("load_balancer must not be empty".to_string());
/// assert!(err.to_string().contains("load_balancer"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum AlbError {
    /// HTTP-level error: non-2xx status code from the AWS API.
    #[error("{service} API HTTP error: status={status}, body={body}")]
    HttpError {
        service: String,
        status: u16,
        body: String,
    },

    /// API returned an error document (XML `<Error>` or JSON `__type`).
    #[error("{service} API error: code={code}, message={message}")]
    ApiResponseError {
        service: String,
        code: String,
        message: String,
    },

    /// HMAC signing failed (invalid key length).
    #[error("HMAC signing error: {0}")]
    HmacError(String),

    /// An underlying HTTP transport error from `reqwest`.
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// JSON serialization or deserialization failure.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Account configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// No static keys were configured and none were found in the environment.
    #[error("No AWS credentials configured")]
    MissingCredentials,

    /// No region was configured and the instance metadata service did not answer.
    #[error("Unable to determine AWS region")]
    MissingRegion,
}

/// Convenience type alias so callers can write `error::Result<T>`.
pub type Result<T> = std::result::Result<T, AlbError>;
