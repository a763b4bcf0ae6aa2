//! # Error Handling
//! 
//! Custom error types for the relay and how they become HTTP responses.
//! 
//! ## Two layers:
//! - **anyhow::Result**: internal plumbing (process spawning, config loading)
//!   where the caller only needs a message with context
//! - **AppError**: the boundary type handlers return; each variant picks an
//!   HTTP status
//! 
//! ## Key Rust Concepts:
//! - **Enums for error kinds**: one variant per failure category, matched exhaustively
//! - **From trait**: lets `?` convert anyhow/serde_json/config errors automatically
//! - **ResponseError trait**: actix calls this to render an error as a response
//! 
//! Messages end up in responses and logs, so they name the session or book
//! involved but never carry credentials.

use actix_web::http::StatusCode;               // Type-safe HTTP status codes
use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait

/// Custom error types for the application.
/// 
/// ## Rust Concepts:
/// - **enum**: A type that can be one of several variants
/// - **String**: Each variant holds an error message
/// - **#[derive(Debug)]**: Automatically implements debug printing
/// 
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **Unavailable**: The relay is at capacity (503 errors)
/// 
/// ## Usage Example:
/// ```ignore
/// return Err(AppError::NotFound(format!("Session {} not found", id)));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors (database failures, memory issues, etc.)
    Internal(String),
    
    /// Client sent invalid or malformed data
    BadRequest(String),
    
    /// Requested resource was not found
    NotFound(String),
    
    /// Configuration file or environment variable problems
    ConfigError(String),
    
    /// User input failed validation rules (e.g. volume outside 0.0..=1.5)
    ValidationError(String),

    /// Temporarily unable to serve, e.g. the session limit is reached
    Unavailable(String),
}

/// Implementation of the Display trait for AppError.
/// 
/// ## Purpose:
/// This trait defines how errors are formatted as human-readable strings.
/// It's used when you print an error or convert it to a string.
/// 
/// ## Rust Concepts:
/// - **impl Trait for Type**: Implementing a trait for our custom type
/// - **match**: Pattern matching to handle each error variant
/// - **write!**: Macro for formatting strings (like printf in C)
/// - **&self**: Immutable reference to the error
/// 
/// ## Trait Requirements:
/// The Display trait requires one method: `fmt`. This method writes
/// the formatted error message to a formatter.
impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Implementation of the ResponseError trait for AppError.
/// 
/// ## Purpose:
/// This trait converts our custom errors into HTTP responses that clients can understand.
/// It automatically handles the conversion when an error is returned from a handler.
/// 
/// ## HTTP Status Code Mapping:
/// - Internal/ConfigError → 500 (Internal Server Error)
/// - BadRequest/ValidationError → 400 (Bad Request)
/// - NotFound → 404 (Not Found)
/// - Unavailable → 503 (Service Unavailable)
/// 
/// ## JSON Response Format:
/// All errors return a flat JSON object so clients can read `error` directly:
/// ```json
/// {
///   "error": "volume must be between 0 and 1.5, got 2",
///   "type": "validation_error",
///   "timestamp": "2025-01-01T12:00:00Z"
/// }
/// ```
/// 
/// ## Rust Concepts:
/// - **Tuple destructuring**: `let (kind, message) = self.parts()`
/// - **json! macro**: Creates JSON values easily
/// - **StatusCode enum**: HTTP status codes as type-safe values
/// - **.clone()**: Creates a copy of the error message string
impl AppError {
    /// Machine-readable kind and the message, without the Display prefix.
    fn parts(&self) -> (&'static str, &str) {
        match self {
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::NotFound(msg) => ("not_found", msg),
            AppError::ConfigError(msg) => ("config_error", msg),
            AppError::ValidationError(msg) => ("validation_error", msg),
            AppError::Unavailable(msg) => ("unavailable", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR, // 500
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,    // 400
            AppError::NotFound(_) => StatusCode::NOT_FOUND,                                      // 404
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,                         // 503
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = self.parts();

        // Build the HTTP response with JSON body
        HttpResponse::build(self.status_code()).json(json!({
            "error": message,                             // Human-readable error message
            "type": error_type,                           // Machine-readable error type
            "timestamp": chrono::Utc::now().to_rfc3339()  // When the error occurred
        }))
    }
}

/// Automatic conversion from anyhow::Error to AppError.
/// 
/// ## Purpose:
/// The anyhow crate provides general-purpose error handling. This conversion
/// allows us to use anyhow errors throughout the codebase and automatically
/// convert them to our custom error type when needed.
/// 
/// ## Rust Concepts:
/// - **From trait**: Enables automatic conversion with `.into()` or `?`
/// - **Self**: Refers to AppError (the type we're implementing for)
/// - **.to_string()**: Converts the error to a string representation
/// 
/// ## Usage:
/// When you use `?` with an anyhow::Error, it automatically becomes an AppError::Internal.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        // {:#} keeps the context chain ("failed to spawn decoder: No such file")
        AppError::Internal(format!("{:#}", err))
    }
}

/// Automatic conversion from JSON parsing errors to AppError.
/// 
/// ## Purpose:
/// When parsing JSON from HTTP requests fails, we want to return a BadRequest
/// error with a helpful message about what went wrong.
/// 
/// ## Why BadRequest:
/// The only JSON we parse is request bodies (e.g. `{"volume": 0.5}`), so a parse
/// failure is the client's malformed data: 400, not 500.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

/// Automatic conversion from configuration errors to AppError.
/// 
/// ## Purpose:
/// Configuration loading can fail for various reasons (missing files, invalid syntax, etc.).
/// These are server-side issues that should be treated as configuration errors.
/// 
/// ## When this happens:
/// - config.toml file has invalid syntax
/// - An `APP__...` variable can't be parsed into its field type
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Type alias for Results that use our custom error type.
/// 
/// ## Purpose:
/// This creates a shorthand for `Result<T, AppError>` so you can write
/// `AppResult<String>` instead of `Result<String, AppError>`.
/// 
/// ## Usage Example:
/// ```ignore
/// fn status(&self, id: &str) -> AppResult<SessionStatus> {
///     // This is equivalent to: fn status(..) -> Result<SessionStatus, AppError>
///     self.sessions.status(id).ok_or_else(|| AppError::NotFound(id.to_string()))
/// }
/// ```
/// 
/// ## Rust Concepts:
/// - **type alias**: Creates a new name for an existing type
/// - **Generic type**: `T` can be any type (String, AppConfig, etc.)
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[actix_web::test]
    async fn test_status_codes() {
        assert_eq!(AppError::ValidationError("x".into()).status_code(), 400);
        assert_eq!(AppError::NotFound("x".into()).status_code(), 404);
        assert_eq!(AppError::Unavailable("x".into()).status_code(), 503);
        assert_eq!(AppError::Internal("x".into()).status_code(), 500);
    }

    #[actix_web::test]
    async fn test_error_body_shape() {
        let response = AppError::NotFound("Session abc not found".into()).error_response();
        let body = to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(json["error"], "Session abc not found");
        assert_eq!(json["type"], "not_found");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_json_errors_are_client_errors() {
        let err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        assert!(matches!(AppError::from(err), AppError::BadRequest(_)));
    }
}
