use std::collections::HashMap;

use actix_web::http::StatusCode;
use actix_web::web::Data;
use actix_web::web::Form;
use actix_web::web::Query;
use actix_web::HttpResponse;
use chrono::DateTime;
use chrono::Utc;
use htmlescape::encode_minimal;
use serde::Deserialize;
use serde_json::json;
use serde_json::Value;
use sqlx::Row;
use sqlx::SqlitePool;
use url::Url;

use crate::authentication::AccessGrant;
use crate::configuration::Settings;
use crate::indieauth;
use crate::indieauth::ClientInfo;
use crate::utils::error_500;
use crate::utils::oauth_error;

#[derive(Deserialize)]
pub struct AuthorizationRequest {
    pub response_type: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub state: String,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub scope: Option<String>,
    pub me: Option<String>,
}

fn invalid_request() -> HttpResponse {
    oauth_error(StatusCode::BAD_REQUEST, "invalid_request")
}

fn invalid_grant() -> HttpResponse { oauth_error(StatusCode::BAD_REQUEST, "invalid_grant") }

/// Whether the redirect URI is acceptable for this client: same origin as
/// the `client_id`, or registered via `rel="redirect_uri"`.
fn redirect_uri_allowed(client_id: &str, redirect_uri: &str, info: &ClientInfo) -> bool {
    let same_origin = match (Url::parse(client_id), Url::parse(redirect_uri)) {
        (Ok(client), Ok(redirect)) => {
            client.scheme() == redirect.scheme()
                && client.host_str() == redirect.host_str()
                && client.port() == redirect.port()
        }
        _ => false,
    };

    same_origin || info.redirect_uris.contains(redirect_uri)
}

/// Handle the authorization request: vet the client, persist a short-lived
/// code, and render the consent page.
pub async fn authorization(
    query: Query<AuthorizationRequest>,
    pool: Data<SqlitePool>,
    http: Data<reqwest::Client>,
    settings: Data<Settings>,
) -> Result<HttpResponse, actix_web::Error> {
    let request = query.into_inner();

    if !indieauth::RESPONSE_TYPES_SUPPORTED.contains(&request.response_type.as_str())
        || !indieauth::CODE_CHALLENGE_METHODS_SUPPORTED
            .contains(&request.code_challenge_method.as_str())
    {
        return Ok(invalid_request());
    }

    let info = indieauth::get_client_info(&http, &request.client_id)
        .await
        .unwrap_or_else(|_| ClientInfo {
            name: request.client_id.clone(),
            url: request.client_id.clone(),
            image: None,
            redirect_uris: Default::default(),
        });

    if !redirect_uri_allowed(&request.client_id, &request.redirect_uri, &info) {
        return Ok(invalid_request());
    }

    let code = indieauth::new_authorization_code();
    let created_at = Utc::now();

    sqlx::query(
        r#"
INSERT INTO oauth_authorization_codes (
    code,
    client_id,
    redirect_uri,
    scope,
    code_challenge,
    code_challenge_method,
    used,
    expires_at,
    created_at
)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, FALSE, ?7, ?8);
        "#,
    )
    .bind(&code)
    .bind(&request.client_id)
    .bind(&request.redirect_uri)
    .bind(&request.scope)
    .bind(&request.code_challenge)
    .bind(&request.code_challenge_method)
    .bind(created_at + indieauth::code_expires_in())
    .bind(created_at)
    .execute(pool.get_ref())
    .await
    .map_err(error_500)?;

    let mut redirect_url = Url::parse(&request.redirect_uri).map_err(error_500)?;
    redirect_url
        .query_pairs_mut()
        .append_pair("code", &code)
        .append_pair("state", &request.state)
        .append_pair("iss", &settings.metadata_url());

    Ok(HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(consent_page(&request, &info, &redirect_url)))
}

fn consent_page(request: &AuthorizationRequest, info: &ClientInfo, redirect_url: &Url) -> String {
    let name = encode_minimal(&info.name);
    let client_url = encode_minimal(&info.url);
    let me = encode_minimal(
        &request
            .me
            .as_deref()
            .map(crate::urls::canonicalize_url)
            .unwrap_or_default(),
    );

    let scopes = request
        .scope
        .as_deref()
        .unwrap_or("")
        .split_whitespace()
        .map(|scope| format!("<li><code>{}</code></li>", encode_minimal(scope)))
        .collect::<String>();

    let image = info
        .image
        .as_deref()
        .map(|src| format!(r#"<img src="{}" alt="">"#, encode_minimal(src)))
        .unwrap_or_default();

    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Authorize {name}</title></head>
<body>
<main class="h-x-consent">
    {image}
    <p><a href="{client_url}">{name}</a> wants to sign in as <strong>{me}</strong>.</p>
    <ul>{scopes}</ul>
    <a class="button" href="{href}">Continue</a>
</main>
</body>
</html>
"#,
        href = encode_minimal(redirect_url.as_str()),
    )
}

struct RedeemedCode {
    scope: Option<String>,
}

/// Look up, check, and consume an authorization code. Any failure is the
/// same `invalid_grant` to the caller.
async fn redeem_code(
    pool: &SqlitePool,
    payload: &HashMap<String, String>,
) -> Result<Result<RedeemedCode, HttpResponse>, actix_web::Error> {
    let (Some(code), Some(client_id), Some(redirect_uri)) = (
        payload.get("code"),
        payload.get("client_id"),
        payload.get("redirect_uri"),
    ) else {
        return Ok(Err(invalid_request()));
    };

    let row = sqlx::query(
        r#"
SELECT
    client_id,
    redirect_uri,
    scope,
    code_challenge,
    code_challenge_method,
    used,
    expires_at
FROM
    oauth_authorization_codes
WHERE
    code = ?1;
        "#,
    )
    .bind(code)
    .fetch_optional(pool)
    .await
    .map_err(error_500)?;

    let Some(row) = row else {
        return Ok(Err(invalid_grant()));
    };

    let used: bool = row.try_get("used").map_err(error_500)?;
    let expires_at: DateTime<Utc> = row.try_get("expires_at").map_err(error_500)?;
    let stored_client_id: String = row.try_get("client_id").map_err(error_500)?;
    let stored_redirect_uri: String = row.try_get("redirect_uri").map_err(error_500)?;
    let challenge: String = row.try_get("code_challenge").map_err(error_500)?;
    let method: String = row.try_get("code_challenge_method").map_err(error_500)?;
    let scope: Option<String> = row.try_get("scope").map_err(error_500)?;

    // codes are single-use
    if used || expires_at < Utc::now() {
        return Ok(Err(invalid_grant()));
    }

    if &stored_client_id != client_id || &stored_redirect_uri != redirect_uri {
        return Ok(Err(invalid_grant()));
    }

    let verifier = payload.get("code_verifier").map(String::as_str).unwrap_or("");
    if !indieauth::verify_challenge(&challenge, &method, verifier) {
        return Ok(Err(invalid_grant()));
    }

    sqlx::query("UPDATE oauth_authorization_codes SET used = TRUE WHERE code = ?1;")
        .bind(code)
        .execute(pool)
        .await
        .map_err(error_500)?;

    Ok(Ok(RedeemedCode { scope }))
}

/// POST /auth: redeem a code for the profile URL only.
pub async fn profile_exchange(
    form: Form<HashMap<String, String>>,
    pool: Data<SqlitePool>,
    settings: Data<Settings>,
) -> Result<HttpResponse, actix_web::Error> {
    let payload = form.into_inner();

    if payload.get("grant_type").map(String::as_str) != Some("authorization_code") {
        return Ok(invalid_request());
    }

    match redeem_code(pool.get_ref(), &payload).await? {
        Ok(_) => Ok(HttpResponse::Ok().json(json!({"me": settings.home_url()}))),
        Err(response) => Ok(response),
    }
}

fn profile_json(settings: &Settings, scope: &str) -> Value {
    let mut profile = json!({
        "name": settings.owner.name,
        "url": settings.home_url(),
        "photo": settings.photo_url(),
    });
    if scope.split_whitespace().any(|s| s == "email") {
        profile["email"] = json!(settings.owner.email);
    }
    profile
}

/// POST /token: dispatch by grant type.
pub async fn token(
    form: Form<HashMap<String, String>>,
    pool: Data<SqlitePool>,
    settings: Data<Settings>,
) -> Result<HttpResponse, actix_web::Error> {
    let payload = form.into_inner();

    match payload.get("grant_type").map(String::as_str) {
        Some("authorization_code") => access_token_grant(&payload, &pool, &settings).await,
        Some("refresh_token") => refresh_token_grant(&payload, &pool).await,
        Some(_) => Ok(oauth_error(StatusCode::BAD_REQUEST, "unsupported_grant_type")),
        None => Ok(invalid_request()),
    }
}

async fn access_token_grant(
    payload: &HashMap<String, String>,
    pool: &SqlitePool,
    settings: &Settings,
) -> Result<HttpResponse, actix_web::Error> {
    let redeemed = match redeem_code(pool, payload).await? {
        Ok(redeemed) => redeemed,
        Err(response) => return Ok(response),
    };

    // a code issued without scope can only go through the profile exchange
    let Some(scope) = redeemed.scope.filter(|scope| !scope.is_empty()) else {
        return Ok(invalid_request());
    };

    let access_token = indieauth::new_access_token();
    let refresh_token = indieauth::new_refresh_token();
    let created_at = Utc::now();
    let expires_at = created_at + indieauth::token_expires_in();

    sqlx::query(
        r#"
INSERT INTO oauth_tokens (
    client_id,
    token_type,
    access_token,
    refresh_token,
    scope,
    expires_at,
    last_refresh_at,
    created_at
)
VALUES (?1, 'Bearer', ?2, ?3, ?4, ?5, ?6, ?6);
        "#,
    )
    .bind(payload.get("client_id").map(String::as_str))
    .bind(&access_token)
    .bind(&refresh_token)
    .bind(&scope)
    .bind(expires_at)
    .bind(created_at)
    .execute(pool)
    .await
    .map_err(error_500)?;

    let mut response = json!({
        "access_token": access_token,
        "refresh_token": refresh_token,
        "me": settings.home_url(),
        "expires_in": indieauth::token_expires_in().num_seconds(),
        "token_type": "Bearer",
        "scope": scope,
    });
    if scope.split_whitespace().any(|s| s == "profile") {
        response["profile"] = profile_json(settings, &scope);
    }

    Ok(HttpResponse::Ok().json(response))
}

async fn refresh_token_grant(
    payload: &HashMap<String, String>,
    pool: &SqlitePool,
) -> Result<HttpResponse, actix_web::Error> {
    let Some(refresh_token) = payload.get("refresh_token") else {
        return Ok(invalid_request());
    };

    let row = sqlx::query(
        r#"
SELECT scope, expires_at, created_at
FROM oauth_tokens
WHERE refresh_token = ?1;
        "#,
    )
    .bind(refresh_token)
    .fetch_optional(pool)
    .await
    .map_err(error_500)?;

    let Some(row) = row else {
        return Ok(invalid_grant());
    };

    let expires_at: DateTime<Utc> = row.try_get("expires_at").map_err(error_500)?;
    let original_scope: String = row.try_get("scope").map_err(error_500)?;

    if expires_at < Utc::now() {
        return Ok(invalid_grant());
    }

    // a refresh must never widen the grant
    let scope = match payload.get("scope") {
        Some(requested) if !indieauth::scope_is_subset(requested, &original_scope) => {
            return Ok(oauth_error(StatusCode::BAD_REQUEST, "invalid_scope"));
        }
        Some(requested) => requested.clone(),
        None => original_scope,
    };

    let new_access_token = indieauth::new_access_token();
    let new_refresh_token = indieauth::new_refresh_token();
    let now = Utc::now();
    let new_expires_at = now + indieauth::token_expires_in();

    // both tokens rotate atomically; `created_at` is preserved
    sqlx::query(
        r#"
UPDATE oauth_tokens
SET
    access_token = ?1,
    refresh_token = ?2,
    scope = ?3,
    expires_at = ?4,
    last_refresh_at = ?5
WHERE
    refresh_token = ?6;
        "#,
    )
    .bind(&new_access_token)
    .bind(&new_refresh_token)
    .bind(&scope)
    .bind(new_expires_at)
    .bind(now)
    .bind(refresh_token)
    .execute(pool)
    .await
    .map_err(error_500)?;

    Ok(HttpResponse::Ok().json(json!({
        "access_token": new_access_token,
        "refresh_token": new_refresh_token,
        "expires_in": indieauth::token_expires_in().num_seconds(),
        "token_type": "Bearer",
        "scope": scope,
    })))
}

#[derive(Deserialize)]
pub struct TokenRequest {
    pub token: String,
}

/// POST /introspect: report whether a token is active.
///
/// https://datatracker.ietf.org/doc/html/rfc7662
pub async fn introspect(
    form: Form<TokenRequest>,
    pool: Data<SqlitePool>,
    settings: Data<Settings>,
) -> Result<HttpResponse, actix_web::Error> {
    let row = sqlx::query(
        r#"
SELECT client_id, scope, expires_at, created_at
FROM oauth_tokens
WHERE access_token = ?1 OR refresh_token = ?1;
        "#,
    )
    .bind(&form.token)
    .fetch_optional(pool.get_ref())
    .await
    .map_err(error_500)?;

    let Some(row) = row else {
        return Ok(HttpResponse::Ok().json(json!({"active": false})));
    };

    let expires_at: DateTime<Utc> = row.try_get("expires_at").map_err(error_500)?;
    if expires_at < Utc::now() {
        return Ok(HttpResponse::Ok().json(json!({"active": false})));
    }

    let client_id: String = row.try_get("client_id").map_err(error_500)?;
    let scope: String = row.try_get("scope").map_err(error_500)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(error_500)?;

    Ok(HttpResponse::Ok().json(json!({
        "active": true,
        "me": settings.home_url(),
        "client_id": client_id,
        "scope": scope,
        "exp": expires_at.timestamp(),
        "iat": created_at.timestamp(),
    })))
}

/// POST /revoke: expire a token immediately. Unknown tokens still return
/// 200, per RFC 7009. The legacy `?action=revoke` query form is accepted.
pub async fn revoke(
    form: Form<TokenRequest>,
    pool: Data<SqlitePool>,
) -> Result<HttpResponse, actix_web::Error> {
    sqlx::query(
        r#"
UPDATE oauth_tokens
SET expires_at = ?1
WHERE access_token = ?2 OR refresh_token = ?2;
        "#,
    )
    .bind(Utc::now())
    .bind(&form.token)
    .execute(pool.get_ref())
    .await
    .map_err(error_500)?;

    Ok(HttpResponse::Ok().finish())
}

/// GET /userinfo: the owner's profile, for tokens carrying the `profile`
/// scope.
pub async fn userinfo(
    grant: AccessGrant,
    settings: Data<Settings>,
) -> Result<HttpResponse, actix_web::Error> {
    grant.require("profile")?;

    Ok(HttpResponse::Ok().json(profile_json(&settings, &grant.scope)))
}
