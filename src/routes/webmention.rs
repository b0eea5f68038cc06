use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::web::Data;
use actix_web::web::Form;
use actix_web::web::Path;
use actix_web::HttpResponse;
use chrono::SecondsFormat;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use sqlx::Row;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::configuration::Settings;
use crate::urls::RouteTable;
use crate::utils::error_500;
use crate::webmention::process_webmention;
use crate::webmention::receive::RECEIVED_MESSAGE;
use crate::webmention::verify_request;
use crate::webmention::WebmentionStatus;

#[derive(Deserialize)]
pub struct WebmentionRequest {
    pub source: String,
    pub target: String,
    pub vouch: Option<String>,
}

fn failure(status: StatusCode, message: &str) -> HttpResponse {
    HttpResponse::build(status).json(json!({
        "status": WebmentionStatus::Failure.as_str(),
        "message": message,
    }))
}

/// Receive a webmention.
///
/// The synchronous part verifies the request, persists the `received` row,
/// and answers 201 with the status URL; validation then runs as a detached
/// task.
///
/// https://www.w3.org/TR/webmention/#receiving-webmentions
pub async fn webmention_receive(
    form: Form<WebmentionRequest>,
    pool: Data<SqlitePool>,
    http: Data<reqwest::Client>,
    routes: Data<Arc<RouteTable>>,
    settings: Data<Settings>,
) -> Result<HttpResponse, actix_web::Error> {
    let data = form.into_inner();

    if let Err(reason) = verify_request(&routes, &settings, &data.source, &data.target) {
        return Ok(failure(StatusCode::BAD_REQUEST, &reason));
    }

    if settings.require_vouch && data.vouch.is_none() {
        return Ok(failure(
            StatusCode::from_u16(449).expect("449 is a valid status code"),
            "The webmention does not contain a `vouch` field.",
        ));
    }

    let uuid = Uuid::new_v4();
    let now = Utc::now();

    // a repeated (source, target) pair updates the existing row and keeps
    // its uuid, so clients always poll the same status URL
    let row = sqlx::query(
        r#"
INSERT INTO incoming_webmentions (
    uuid,
    source,
    target,
    vouch,
    status,
    message,
    created_at,
    last_modified_at
)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
ON CONFLICT (source, target) DO UPDATE SET
    vouch = excluded.vouch,
    status = excluded.status,
    message = excluded.message,
    last_modified_at = excluded.last_modified_at
RETURNING uuid;
        "#,
    )
    .bind(uuid.simple().to_string())
    .bind(&data.source)
    .bind(&data.target)
    .bind(&data.vouch)
    .bind(WebmentionStatus::Received.as_str())
    .bind(RECEIVED_MESSAGE)
    .bind(now)
    .fetch_one(pool.get_ref())
    .await
    .map_err(error_500)?;

    let row_uuid: String = row.try_get("uuid").map_err(error_500)?;
    let uuid = Uuid::parse_str(&row_uuid).map_err(error_500)?;

    tokio::spawn(process_webmention(
        pool.get_ref().clone(),
        http.get_ref().clone(),
        Arc::clone(&routes),
        settings.get_ref().clone(),
        uuid,
        data.source,
        data.target,
        data.vouch,
    ));

    Ok(HttpResponse::Created()
        .insert_header((
            actix_web::http::header::LOCATION,
            settings.webmention_status_url(&uuid),
        ))
        .finish())
}

/// Check the status of a webmention.
///
/// https://www.w3.org/TR/webmention/#checking-the-status-of-a-webmention
pub async fn webmention_status(
    path: Path<Uuid>,
    pool: Data<SqlitePool>,
) -> Result<HttpResponse, actix_web::Error> {
    let uuid = path.into_inner();

    let row = sqlx::query(
        r#"
SELECT
    status,
    message,
    last_modified_at
FROM
    incoming_webmentions
WHERE
    uuid = ?1;
        "#,
    )
    .bind(uuid.simple().to_string())
    .fetch_optional(pool.get_ref())
    .await
    .map_err(error_500)?;

    let Some(row) = row else {
        return Ok(HttpResponse::NotFound().finish());
    };

    let status: String = row.try_get("status").map_err(error_500)?;
    let message: String = row.try_get("message").map_err(error_500)?;
    let last_modified_at: chrono::DateTime<Utc> =
        row.try_get("last_modified_at").map_err(error_500)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": status,
        "message": message,
        "last_modified_at": last_modified_at.to_rfc3339_opts(SecondsFormat::Micros, true),
    })))
}
