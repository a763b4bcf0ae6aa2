//! Relay access log: one line per request, tagged with the book and session
//! it touched. Stream responses are logged when their headers go out; the
//! body outlives the line.

use crate::handlers::SESSION_ID_HEADER;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header::HeaderMap,
    Error, HttpRequest,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};
use tracing::{debug, info, warn};

/// Book and session a request was about, taken from the matched route or,
/// for a new stream, from the `X-Session-Id` response header.
#[derive(Debug, Default, PartialEq)]
pub struct RelayFields {
    pub route: Option<String>,
    pub book_id: Option<String>,
    pub session_id: Option<String>,
}

impl RelayFields {
    pub fn collect(req: &HttpRequest, response_headers: &HeaderMap) -> Self {
        let path_param = |name: &str| req.match_info().get(name).map(str::to_string);
        let session_id = path_param("session_id").or_else(|| {
            response_headers
                .get(SESSION_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        });

        Self {
            route: req.match_pattern(),
            book_id: path_param("book_id"),
            session_id,
        }
    }
}

pub struct RequestLogging;

impl<S, B> Transform<S, ServiceRequest> for RequestLogging
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestLoggingMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestLoggingMiddleware { service }))
    }
}

pub struct RequestLoggingMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for RequestLoggingMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let started = Instant::now();
        let method = req.method().clone();
        let path = req.path().to_string();
        debug!(%method, %path, "Relay request");

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match &result {
                Ok(response) => {
                    let fields = RelayFields::collect(response.request(), response.headers());
                    let status = response.status().as_u16();
                    let route = fields.route.as_deref().unwrap_or("<unmatched>");
                    let book_id = fields.book_id.as_deref().unwrap_or("-");
                    let session_id = fields.session_id.as_deref().unwrap_or("-");

                    if response.status().is_server_error() {
                        warn!(%method, route, book_id, session_id, status, elapsed_ms, "Relay request failed");
                    } else {
                        info!(%method, route, book_id, session_id, status, elapsed_ms, "Relay request");
                    }
                }
                Err(err) => {
                    warn!(%method, %path, elapsed_ms, error = %err, "Relay request errored");
                }
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::header::{HeaderName, HeaderValue};
    use actix_web::test::TestRequest;

    #[test]
    fn test_fields_from_stream_route() {
        let req = TestRequest::get()
            .uri("/stream/moby-dick?start=30")
            .param("book_id", "moby-dick")
            .to_http_request();
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-session-id"),
            HeaderValue::from_static("moby-dick-1700000000000"),
        );

        let fields = RelayFields::collect(&req, &headers);
        assert_eq!(fields.book_id.as_deref(), Some("moby-dick"));
        assert_eq!(fields.session_id.as_deref(), Some("moby-dick-1700000000000"));
    }

    #[test]
    fn test_path_session_wins_over_header() {
        let req = TestRequest::post()
            .uri("/volume/abc")
            .param("session_id", "abc")
            .to_http_request();
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-session-id"),
            HeaderValue::from_static("other"),
        );

        let fields = RelayFields::collect(&req, &headers);
        assert_eq!(fields.session_id.as_deref(), Some("abc"));
        assert_eq!(fields.book_id, None);
    }

    #[test]
    fn test_unrelated_request_has_no_fields() {
        let req = TestRequest::get().uri("/health").to_http_request();
        let fields = RelayFields::collect(&req, &HeaderMap::new());
        assert_eq!(fields.book_id, None);
        assert_eq!(fields.session_id, None);
    }
}
