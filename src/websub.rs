//! WebSub hub: subscription validation with challenge echo, lease
//! management, and signed content distribution.
//!
//! https://www.w3.org/TR/websub/

use chrono::DateTime;
use chrono::Duration;
use chrono::SecondsFormat;
use chrono::Utc;
use hmac::Hmac;
use hmac::Mac;
use serde::Deserialize;
use sha1::Sha1;
use sqlx::Row;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::configuration::Settings;
use crate::events::Event;
use crate::events::EventHandler;
use crate::events::HandlerFuture;
use crate::feed;
use crate::store;

/// Leases are capped at a year, whatever the subscriber asks for.
pub fn max_lease() -> Duration { Duration::days(365) }

/// Transport-level retries when POSTing to a callback.
const DELIVERY_RETRIES: usize = 3;

/// A subscription request. Hubs must ignore additional request parameters
/// they do not understand, so unknown `hub.*` keys are dropped on parse.
#[derive(Clone, Debug, Deserialize)]
pub struct SubscriptionRequest {
    #[serde(rename = "hub.mode")]
    pub mode: String,
    #[serde(rename = "hub.topic")]
    pub topic: String,
    #[serde(rename = "hub.callback")]
    pub callback: String,
    #[serde(rename = "hub.lease_seconds", default)]
    pub lease_seconds: Option<i64>,
    #[serde(rename = "hub.secret", default)]
    pub secret: Option<String>,
}

/// Verify a subscription request against its callback, then persist (or
/// drop) the subscription.
pub async fn validate_subscription(
    pool: SqlitePool,
    http: reqwest::Client,
    data: SubscriptionRequest,
) {
    let outcome = if data.mode == "subscribe" {
        subscribe(&pool, &http, &data).await
    } else {
        unsubscribe(&pool, &http, &data).await
    };

    if let Err(e) = outcome {
        tracing::error!(
            error.cause_chain = ?e,
            callback = %data.callback,
            "subscription validation failed"
        );
    }
}

/// Echo a random challenge off the callback. Any failure, or a body that is
/// not exactly the challenge, aborts the operation silently.
async fn echo_challenge(
    http: &reqwest::Client,
    data: &SubscriptionRequest,
    lease_seconds: Option<i64>,
) -> anyhow::Result<bool> {
    let challenge = Uuid::new_v4().simple().to_string();

    let mut params = vec![
        ("hub.mode", data.mode.clone()),
        ("hub.topic", data.topic.clone()),
        ("hub.challenge", challenge.clone()),
    ];
    if let Some(lease) = lease_seconds {
        params.push(("hub.lease_seconds", lease.to_string()));
    }

    let response = match http.get(&data.callback).query(&params).send().await {
        Ok(response) => response,
        Err(_) => return Ok(false),
    };
    if !response.status().is_success() {
        return Ok(false);
    }

    let body = response.bytes().await?;
    Ok(body.as_ref() == challenge.as_bytes())
}

async fn subscribe(
    pool: &SqlitePool,
    http: &reqwest::Client,
    data: &SubscriptionRequest,
) -> anyhow::Result<()> {
    let lease = data
        .lease_seconds
        .map(|requested| requested.min(max_lease().num_seconds()))
        .unwrap_or_else(|| max_lease().num_seconds());
    let expires_at = Utc::now() + Duration::seconds(lease);

    if !echo_challenge(http, data, Some(lease)).await? {
        return Ok(());
    }

    sqlx::query(
        r#"
INSERT INTO websub_subscriptions (
    callback,
    topic,
    expires_at,
    secret,
    last_delivery_at
)
VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT(callback, topic) DO UPDATE SET
    expires_at = excluded.expires_at,
    secret = excluded.secret;
        "#,
    )
    .bind(&data.callback)
    .bind(&data.topic)
    .bind(expires_at)
    .bind(&data.secret)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

async fn unsubscribe(
    pool: &SqlitePool,
    http: &reqwest::Client,
    data: &SubscriptionRequest,
) -> anyhow::Result<()> {
    if !echo_challenge(http, data, None).await? {
        return Ok(());
    }

    sqlx::query(
        r#"
DELETE FROM
    websub_subscriptions
WHERE
    callback = ?1 AND
    topic = ?2;
        "#,
    )
    .bind(&data.callback)
    .bind(&data.topic)
    .execute(pool)
    .await?;

    Ok(())
}

/// The hex HMAC-SHA1 signature WebSub payloads carry when the subscriber
/// registered a secret.
pub fn content_signature(secret: &str, body: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha1>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Render a topic URL locally, without a network hop.
///
/// Topics are this site's feed and entry pages; a `since` query parameter
/// narrows the feed to what changed since the last delivery.
pub async fn fetch_topic(
    pool: &SqlitePool,
    settings: &Settings,
    topic: &str,
) -> anyhow::Result<(String, Vec<u8>)> {
    let parsed = url::Url::parse(topic)?;
    let since = parsed
        .query_pairs()
        .find(|(key, _)| key == "since")
        .and_then(|(_, value)| DateTime::parse_from_rfc3339(&value).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let path = parsed.path().trim_end_matches('/');

    // an entry page
    if let Some(segment) = path.strip_prefix("/feed/") {
        let uuid = Uuid::parse_str(segment)?;
        let entry = store::get_entry_with_children(pool, &uuid)
            .await?
            .ok_or_else(|| anyhow::anyhow!("unknown topic: {topic}"))?;
        let body = serde_json::to_vec(&feed::hentry_from_entry(&entry))?;
        return Ok(("application/json".to_string(), body));
    }

    let entries = store::get_entries(
        pool,
        &settings.home_url(),
        since,
        0,
        settings.page_size,
    )
    .await?;
    let hfeed = feed::hfeed_from_entries(settings, &entries, topic);
    Ok(("application/json".to_string(), serde_json::to_vec(&hfeed)?))
}

/// Broadcast changed URLs to their active subscribers.
pub async fn distribute_content(
    pool: SqlitePool,
    http: reqwest::Client,
    settings: Settings,
    urls: Vec<String>,
) {
    if urls.is_empty() {
        return;
    }

    let placeholders = (1..=urls.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let query = format!(
        r#"
SELECT callback, topic, secret, last_delivery_at
FROM
    websub_subscriptions
WHERE
    topic IN ({placeholders}) AND
    expires_at > ?{now};
        "#,
        now = urls.len() + 1,
    );

    let mut select = sqlx::query(&query);
    for url in &urls {
        select = select.bind(url);
    }
    select = select.bind(Utc::now());

    let rows = match select.fetch_all(&pool).await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::error!(error.cause_chain = ?e, "failed to load subscriptions");
            return;
        }
    };

    let deliveries = rows.iter().map(|row| {
        let callback: String = row.get("callback");
        let topic: String = row.get("topic");
        let secret: Option<String> = row.get("secret");
        let last_delivery_at: DateTime<Utc> = row.get("last_delivery_at");
        send_to_subscriber(
            &pool,
            &http,
            &settings,
            callback,
            topic,
            secret,
            last_delivery_at,
        )
    });
    futures_util::future::join_all(deliveries).await;
}

async fn send_to_subscriber(
    pool: &SqlitePool,
    http: &reqwest::Client,
    settings: &Settings,
    callback: String,
    topic: String,
    secret: Option<String>,
    previous_delivery_at: DateTime<Utc>,
) {
    // recorded as the task's start time, not its end: a publish racing this
    // delivery will be picked up again on the next one
    let last_delivery_at = Utc::now();

    let since = previous_delivery_at.to_rfc3339_opts(SecondsFormat::Micros, true);
    let url = crate::urls::with_query_param(&topic, "since", &since);

    let (content_type, body) = match fetch_topic(pool, settings, &url).await {
        Ok(fetched) => fetched,
        Err(e) => {
            tracing::error!(error.cause_chain = ?e, topic = %topic, "failed to fetch topic");
            return;
        }
    };

    let link = format!(
        r#"<{}>; rel="hub", <{}>; rel="self""#,
        settings.hub_url(),
        topic
    );

    let mut request = http
        .post(&callback)
        .header(reqwest::header::CONTENT_TYPE, content_type)
        .header(reqwest::header::LINK, link);

    if let Some(ref secret) = secret {
        let signature = content_signature(secret, &body);
        request = request.header("X-Hub-Signature", format!("sha1={signature}"));
    }

    if let Err(e) = deliver_with_retries(request, body).await {
        tracing::error!(error.cause_chain = ?e, callback = %callback, "delivery failed");
        return;
    }

    let updated = sqlx::query(
        r#"
UPDATE
    websub_subscriptions
SET
    last_delivery_at = ?1
WHERE
    callback = ?2 AND
    topic = ?3;
        "#,
    )
    .bind(last_delivery_at)
    .bind(&callback)
    .bind(&topic)
    .execute(pool)
    .await;

    if let Err(e) = updated {
        tracing::error!(error.cause_chain = ?e, "failed to update last_delivery_at");
    }
}

/// POST the payload, retrying a few times on transport errors only; an HTTP
/// error status from the callback is final.
async fn deliver_with_retries(
    request: reqwest::RequestBuilder,
    body: Vec<u8>,
) -> reqwest::Result<()> {
    let mut last_error = None;

    for _ in 0..DELIVERY_RETRIES {
        let attempt = request
            .try_clone()
            .expect("byte bodies are cloneable")
            .body(body.clone());
        match attempt.send().await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_connect() || e.is_timeout() => last_error = Some(e),
            Err(e) => return Err(e),
        }
    }

    Err(last_error.expect("at least one attempt ran"))
}

/// Event-bus subscriber that republishes the feed (and the affected entry
/// page) whenever a post changes.
pub struct WebsubNotifier {
    pub pool: SqlitePool,
    pub http: reqwest::Client,
    pub settings: Settings,
}

impl EventHandler for WebsubNotifier {
    fn name(&self) -> &'static str { "websub" }

    fn handle(&self, event: Event) -> HandlerFuture {
        let pool = self.pool.clone();
        let http = self.http.clone();
        let settings = self.settings.clone();

        Box::pin(async move {
            let entry = match &event {
                Event::EntryCreated { new } => new,
                Event::EntryUpdated { new, .. } => new,
                Event::EntryDeleted { old } => old,
            };
            let urls = vec![settings.feed_url(), entry.location.clone()];
            distribute_content(pool, http, settings, urls).await;
            Ok(())
        })
    }
}
