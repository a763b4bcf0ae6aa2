pub mod session;

pub use session::*;

use crate::error::AppError;
use crate::health;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Response header carrying the id of the session a stream belongs to.
pub const SESSION_ID_HEADER: &str = "X-Session-Id";

/// Registers every relay route. The fallback lives on the `App` itself,
/// see [`not_found`].
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::QueryConfig::default().error_handler(|err, _req| {
        AppError::BadRequest(err.to_string()).into()
    }))
    .app_data(web::PathConfig::default().error_handler(|err, _req| {
        AppError::BadRequest(err.to_string()).into()
    }))
    .route("/stream/{book_id}", web::get().to(stream_book))
    .route("/volume/{session_id}", web::post().to(set_volume))
    .route("/status/{session_id}", web::get().to(session_status))
    .route("/session/{session_id}", web::delete().to(delete_session))
    .route("/health", web::get().to(health::health_check))
    .route("/metrics", web::get().to(health::detailed_metrics));
}

pub async fn not_found() -> HttpResponse {
    HttpResponse::NotFound().json(json!({ "error": "Not found" }))
}
