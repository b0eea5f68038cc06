use actix_web::web::Bytes;
use actix_web::web::Data;
use actix_web::web::Form;
use actix_web::HttpResponse;
use sqlx::SqlitePool;

use crate::configuration::Settings;
use crate::websub::distribute_content;
use crate::websub::validate_subscription;
use crate::websub::SubscriptionRequest;

/// WebSub hub endpoint: subscribe/unsubscribe requests. Validation happens
/// against the callback in the background; the request is acknowledged
/// immediately with 202.
pub async fn websub_hub(
    form: Form<SubscriptionRequest>,
    pool: Data<SqlitePool>,
    http: Data<reqwest::Client>,
    settings: Data<Settings>,
) -> HttpResponse {
    let data = form.into_inner();

    if data.mode != "subscribe" && data.mode != "unsubscribe" {
        return HttpResponse::BadRequest()
            .body(format!("Unsupported hub.mode: {}", data.mode));
    }

    let feed_url = settings.feed_url();
    if !data.topic.starts_with(&feed_url) {
        return HttpResponse::BadRequest()
            .body(format!("Only URLs in {feed_url} are supported"));
    }

    tokio::spawn(validate_subscription(
        pool.get_ref().clone(),
        http.get_ref().clone(),
        data,
    ));

    HttpResponse::Accepted().finish()
}

/// WebSub publish endpoint: notifies the hub that one or more topic URLs
/// changed, triggering a background fanout to subscribers.
pub async fn websub_publish(
    body: Bytes,
    pool: Data<SqlitePool>,
    http: Data<reqwest::Client>,
    settings: Data<Settings>,
) -> HttpResponse {
    // `hub.url[]` may repeat, so the body cannot deserialize into a map
    let Ok(params) = serde_urlencoded::from_bytes::<Vec<(String, String)>>(&body) else {
        return HttpResponse::BadRequest().body("Malformed form body");
    };

    let mode = params
        .iter()
        .find(|(key, _)| key == "hub.mode")
        .map(|(_, value)| value.as_str());
    if mode != Some("publish") {
        return HttpResponse::BadRequest().body("hub.mode must be `publish`");
    }

    let urls: Vec<String> = params
        .into_iter()
        .filter(|(key, _)| key == "hub.url" || key == "hub.url[]")
        .map(|(_, value)| value)
        .collect();

    tokio::spawn(distribute_content(
        pool.get_ref().clone(),
        http.get_ref().clone(),
        settings.get_ref().clone(),
        urls,
    ));

    HttpResponse::Accepted().finish()
}
