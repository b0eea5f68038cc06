use actix_web::web::Data;
use actix_web::web::Path;
use actix_web::web::Query;
use actix_web::FromRequest;
use actix_web::HttpRequest;
use actix_web::HttpResponse;
use serde::Deserialize;
use sqlx::SqlitePool;

use crate::authentication::AccessGrant;
use crate::configuration::Settings;
use crate::feed::hentry_from_entry;
use crate::store;
use crate::utils::error_500;

#[derive(Deserialize)]
pub struct CategoryQuery {
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

/// Posts carrying a category. Anonymous callers only see published, public
/// entries; a valid Bearer token lifts the restriction.
pub async fn category(
    req: HttpRequest,
    path: Path<String>,
    query: Query<CategoryQuery>,
    pool: Data<SqlitePool>,
    settings: Data<Settings>,
) -> Result<HttpResponse, actix_web::Error> {
    let protected = AccessGrant::extract(&req).await.is_err();

    let page_size = query
        .page_size
        .unwrap_or(settings.page_size)
        .min(settings.page_size);
    let offset = query.page.unwrap_or(1).saturating_sub(1) * page_size;

    let entries = store::list_by_category(
        &pool,
        &path.into_inner(),
        &settings.home_url(),
        offset,
        page_size,
        protected,
    )
    .await
    .map_err(error_500)?;

    let items: Vec<_> = entries.iter().map(hentry_from_entry).collect();
    Ok(HttpResponse::Ok().json(items))
}
