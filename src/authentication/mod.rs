use std::future::Future;
use std::pin::Pin;

use actix_web::http::StatusCode;
use actix_web::web::Data;
use actix_web::FromRequest;
use actix_web::HttpRequest;
use actix_web::HttpResponse;
use actix_web::ResponseError;
use chrono::Utc;
use sqlx::Row;
use sqlx::SqlitePool;

use crate::configuration::Settings;
use crate::utils::oauth_error;

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    /// No Bearer token, or one that is unknown or expired.
    #[error("invalid_token")]
    InvalidToken,
    /// A valid token that does not carry the required scope.
    #[error("insufficient_scope")]
    InsufficientScope,
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl ResponseError for AuthError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidToken => StatusCode::UNAUTHORIZED,
            Self::InsufficientScope => StatusCode::FORBIDDEN,
            Self::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        match self {
            Self::InvalidToken => oauth_error(self.status_code(), "invalid_token"),
            Self::InsufficientScope => oauth_error(self.status_code(), "insufficient_scope"),
            Self::Unexpected(_) => HttpResponse::InternalServerError().finish(),
        }
    }
}

/// What a Bearer token resolves to. Extracting this from a request performs
/// the token lookup; handlers then declare the scope they need with
/// [`AccessGrant::require`].
///
/// This is a single-author system, so `me` is always the site owner.
#[derive(Clone, Debug)]
pub struct AccessGrant {
    pub client_id: String,
    pub scope: String,
    pub me: String,
}

impl AccessGrant {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scope.split_whitespace().any(|s| s == scope)
    }

    /// 403 `insufficient_scope` unless the grant covers `scope`.
    pub fn require(&self, scope: &str) -> Result<(), AuthError> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(AuthError::InsufficientScope)
        }
    }
}

fn bearer_token(req: &HttpRequest) -> Option<String> {
    let header = req.headers().get(actix_web::http::header::AUTHORIZATION)?;
    let value = header.to_str().ok()?;
    value.strip_prefix("Bearer ").map(String::from)
}

impl FromRequest for AccessGrant {
    type Error = AuthError;
    type Future = Pin<Box<dyn Future<Output = Result<Self, Self::Error>>>>;

    fn from_request(req: &HttpRequest, _payload: &mut actix_web::dev::Payload) -> Self::Future {
        let pool = req.app_data::<Data<SqlitePool>>().cloned();
        let settings = req.app_data::<Data<Settings>>().cloned();
        let token = bearer_token(req);

        Box::pin(async move {
            let pool = pool.ok_or_else(|| anyhow::anyhow!("missing database pool"))?;
            let settings = settings.ok_or_else(|| anyhow::anyhow!("missing settings"))?;
            let token = token.ok_or(AuthError::InvalidToken)?;

            let row = sqlx::query(
                r#"
SELECT client_id, scope
FROM oauth_tokens
WHERE access_token = ?1 AND expires_at > ?2;
                "#,
            )
            .bind(&token)
            .bind(Utc::now())
            .fetch_optional(pool.get_ref())
            .await
            .map_err(|e| AuthError::Unexpected(e.into()))?;

            match row {
                Some(row) => Ok(AccessGrant {
                    client_id: row
                        .try_get("client_id")
                        .map_err(|e| AuthError::Unexpected(e.into()))?,
                    scope: row
                        .try_get("scope")
                        .map_err(|e| AuthError::Unexpected(e.into()))?,
                    me: settings.home_url(),
                }),
                None => Err(AuthError::InvalidToken),
            }
        })
    }
}
