use crate::error::{AppError, AppResult};
use crate::handlers::SESSION_ID_HEADER;
use crate::state::AppState;
use actix_web::http::header;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Seconds into the book
    pub start: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct VolumeRequest {
    pub volume: f64,
}

pub async fn stream_book(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<StreamQuery>,
) -> AppResult<HttpResponse> {
    let book_id = path.into_inner();
    let start = query.start.unwrap_or(0.0);

    let (session, stream) = state.sessions.create_session(&book_id, start)?;

    Ok(HttpResponse::Ok()
        .content_type("audio/mpeg")
        .insert_header((SESSION_ID_HEADER, session.id.as_str()))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .streaming(stream))
}

pub async fn set_volume(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Bytes,
) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    let request: VolumeRequest = serde_json::from_slice(&body)?;

    if !state.sessions.set_volume(&session_id, request.volume)? {
        return Err(session_not_found(&session_id));
    }

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "volume": request.volume
    })))
}

pub async fn session_status(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    let status = state
        .sessions
        .status(&session_id)
        .ok_or_else(|| session_not_found(&session_id))?;

    Ok(HttpResponse::Ok().json(status))
}

pub async fn delete_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    if !state.sessions.stop_session(&session_id) {
        return Err(session_not_found(&session_id));
    }

    Ok(HttpResponse::Ok().json(json!({ "success": true })))
}

fn session_not_found(session_id: &str) -> AppError {
    AppError::NotFound(format!("Session {} not found", session_id))
}
