use std::fmt::Debug;
use std::fmt::Display;

use actix_web::http::StatusCode;
use actix_web::HttpResponse;

/// Convert arbitrary error types to `actix_web::Error` with HTTP 500.
pub fn error_500<T>(e: T) -> actix_web::Error
where
    T: Debug + Display + 'static,
{
    actix_web::error::ErrorInternalServerError(e)
}

/// OAuth-style error response: the machine-readable identifier as a
/// plain-text body (`invalid_request`, `invalid_grant`, ...).
pub fn oauth_error(status: StatusCode, code: &str) -> HttpResponse {
    HttpResponse::build(status)
        .content_type("text/plain; charset=utf-8")
        .body(code.to_string())
}

/// Micropub-style error response: JSON with `error` and `error_description`.
pub fn json_error(status: StatusCode, code: &str, description: &str) -> HttpResponse {
    HttpResponse::build(status).json(serde_json::json!({
        "error": code,
        "error_description": description,
    }))
}
