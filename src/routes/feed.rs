use actix_web::http::header;
use actix_web::web::Data;
use actix_web::web::Path;
use actix_web::web::Query;
use actix_web::HttpRequest;
use actix_web::HttpResponse;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::configuration::Settings;
use crate::feed::generate_etag;
use crate::feed::hentry_from_entry;
use crate::feed::hfeed_from_entries;
use crate::store;
use crate::utils::error_500;

#[derive(Deserialize)]
pub struct FeedQuery {
    pub since: Option<String>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Whether the client's validators still hold, so a 304 can be served.
fn is_not_modified(req: &HttpRequest, last_modified_at: DateTime<Utc>, etag: &str) -> bool {
    let header_value = |name: header::HeaderName| {
        req.headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(String::from)
    };
    let if_modified_since = header_value(header::IF_MODIFIED_SINCE);
    let if_none_match = header_value(header::IF_NONE_MATCH);

    if if_modified_since.is_none() && if_none_match.is_none() {
        return false;
    }

    if let Some(since) = if_modified_since {
        match DateTime::parse_from_str(&format!("{since} +0000"), "%a, %d %b %Y %H:%M:%S GMT %z")
        {
            Ok(since) if last_modified_at > since.with_timezone(&Utc) => return false,
            Err(_) => return false,
            Ok(_) => {}
        }
    }

    if let Some(candidate) = if_none_match {
        if candidate.trim_matches('"') != etag {
            return false;
        }
    }

    true
}

/// The h-feed of recent posts. This is the WebSub topic URL.
///
/// The response carries `Last-Modified` and `ETag`, and honors
/// `If-Modified-Since`/`If-None-Match` with a 304.
pub async fn feed_index(
    req: HttpRequest,
    query: Query<FeedQuery>,
    pool: Data<SqlitePool>,
    settings: Data<Settings>,
) -> Result<HttpResponse, actix_web::Error> {
    let since = query
        .since
        .as_deref()
        .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        .map(|dt| dt.with_timezone(&Utc));
    let page_size = query
        .page_size
        .unwrap_or(settings.page_size)
        .min(settings.page_size);
    let offset = query.page.unwrap_or(1).saturating_sub(1) * page_size;

    let entries = store::get_entries(&pool, &settings.home_url(), since, offset, page_size)
        .await
        .map_err(error_500)?;

    let last_modified_at = entries
        .iter()
        .map(|entry| entry.last_modified_at)
        .max()
        .unwrap_or_else(Utc::now);
    let etag = generate_etag(&entries);

    if is_not_modified(&req, last_modified_at, &etag) {
        return Ok(HttpResponse::NotModified().finish());
    }

    Ok(HttpResponse::Ok()
        .insert_header((
            header::LAST_MODIFIED,
            last_modified_at.format(HTTP_DATE).to_string(),
        ))
        .insert_header((header::ETAG, format!("\"{etag}\"")))
        .json(hfeed_from_entries(&settings, &entries, &settings.feed_url())))
}

/// An entry page: the post plus its reply tree, as microformats-2 JSON.
pub async fn feed_entry(
    path: Path<Uuid>,
    pool: Data<SqlitePool>,
) -> Result<HttpResponse, actix_web::Error> {
    let uuid = path.into_inner();

    let entry = store::get_entry_with_children(&pool, &uuid)
        .await
        .map_err(error_500)?;

    match entry {
        Some(entry) if !entry.deleted => Ok(HttpResponse::Ok().json(hentry_from_entry(&entry))),
        Some(_) => Ok(HttpResponse::Gone().finish()),
        None => Ok(HttpResponse::NotFound().finish()),
    }
}
