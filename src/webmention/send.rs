use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use scraper::Html;
use scraper::Selector;
use serde_json::Value;
use sqlx::Row;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::configuration::Settings;
use crate::domain::Entry;
use crate::domain::Microformats2;
use crate::events::Event;
use crate::events::EventHandler;
use crate::events::HandlerFuture;
use crate::store;
use crate::urls::find_urls;
use crate::urls::host_of;
use crate::urls::parse_link_header;
use crate::urls::urljoin;
use crate::webmention::receive::PROCESSING_MESSAGE;
use crate::webmention::vouch::find_vouch;
use crate::webmention::WebmentionStatus;

/// Event-bus subscriber that turns entry changes into outgoing webmentions.
pub struct WebmentionSender {
    pub pool: SqlitePool,
    pub http: reqwest::Client,
    pub settings: Settings,
}

impl EventHandler for WebmentionSender {
    fn name(&self) -> &'static str { "webmention" }

    fn handle(&self, event: Event) -> HandlerFuture {
        let pool = self.pool.clone();
        let http = self.http.clone();
        let settings = self.settings.clone();

        Box::pin(async move {
            let (new, old) = match event {
                Event::EntryCreated { new } => (Some(new), None),
                Event::EntryUpdated { new, old } => (Some(new), Some(old)),
                Event::EntryDeleted { old } => (None, Some(old)),
            };
            send_webmentions(&pool, &http, &settings, new.as_ref(), old.as_ref()).await;
            Ok(())
        })
    }
}

/// Extract all URLs from a Microformats2 object: direct `url` arrays,
/// `href`/`src` attributes inside `html` values, and URLs mined from any
/// string leaf.
pub fn extract_urls(content: &Microformats2) -> HashSet<String> {
    let mut urls = HashSet::new();

    fn traverse(value: &Value, urls: &mut HashSet<String>) {
        match value {
            Value::String(s) => urls.extend(find_urls(s)),
            Value::Array(items) => {
                for item in items {
                    traverse(item, urls);
                }
            }
            Value::Object(map) => {
                for (key, item) in map {
                    match key.as_str() {
                        "url" => {
                            if let Value::Array(targets) = item {
                                urls.extend(
                                    targets.iter().filter_map(Value::as_str).map(String::from),
                                );
                            } else if let Some(target) = item.as_str() {
                                urls.insert(target.to_string());
                            }
                        }
                        "html" => {
                            if let Some(html) = item.as_str() {
                                urls.extend(html_urls(html));
                            }
                        }
                        _ => traverse(item, urls),
                    }
                }
            }
            _ => {}
        }
    }

    for value in content.properties.values() {
        traverse(value, &mut urls);
    }

    urls
}

fn html_urls(html: &str) -> Vec<String> {
    let fragment = Html::parse_fragment(html);
    let mut urls = Vec::new();
    for node in fragment.root_element().descendants() {
        if let Some(element) = node.value().as_element() {
            for attr in ["href", "src"] {
                if let Some(url) = element.attr(attr) {
                    urls.push(url.to_string());
                }
            }
        }
    }
    urls
}

/// Discover outgoing links of an entry and notify them with webmentions.
///
/// Targets are taken from both the old and the new content: a target that
/// only appears in the old entry may still need to rebuild its view of us.
pub async fn send_webmentions(
    pool: &SqlitePool,
    http: &reqwest::Client,
    settings: &Settings,
    new_entry: Option<&Entry>,
    old_entry: Option<&Entry>,
) {
    // do not send webmentions when testing
    if settings.is_development() {
        return;
    }

    // only send webmentions for entries authored by us
    let me = settings.home_url();
    if new_entry.is_some_and(|entry| entry.author != me)
        || old_entry.is_some_and(|entry| entry.author != me)
    {
        return;
    }

    let mut targets = HashSet::new();
    let mut source = None;

    for entry in [old_entry, new_entry].into_iter().flatten() {
        targets.extend(
            extract_urls(&entry.content)
                .into_iter()
                .filter(|target| target != &entry.location),
        );
        source = Some(entry.location.clone());
    }

    let Some(source) = source else {
        return;
    };

    let deliveries = targets
        .iter()
        .map(|target| queue_webmention(pool, http, source.clone(), target.clone()));
    futures_util::future::join_all(deliveries).await;
}

/// Re-send the webmentions of an entry when it receives one, so that reply
/// chains propagate upstream.
pub async fn send_salmention(
    pool: &SqlitePool,
    http: &reqwest::Client,
    settings: &Settings,
    source: &str,
) {
    let Some(uuid) = source
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|segment| Uuid::parse_str(segment).ok())
    else {
        return;
    };

    match store::get_entry(pool, &uuid).await {
        Ok(Some(entry)) => {
            send_webmentions(pool, http, settings, Some(&entry), Some(&entry)).await;
        }
        Ok(None) => {}
        Err(e) => {
            tracing::error!(error.cause_chain = ?e, "failed to load entry for salmention");
        }
    }
}

/// Persists delivery state for one outgoing webmention row.
struct OutgoingLog<'a> {
    pool: &'a SqlitePool,
    uuid: Uuid,
}

impl OutgoingLog<'_> {
    async fn record(
        &self,
        status: WebmentionStatus,
        message: &str,
        vouch: Option<&str>,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r#"
UPDATE outgoing_webmentions
SET
    status = ?1,
    message = ?2,
    vouch = ?3,
    last_modified_at = ?4
WHERE
    uuid = ?5;
            "#,
        )
        .bind(status.as_str())
        .bind(message)
        .bind(vouch)
        .bind(Utc::now())
        .bind(self.uuid.simple().to_string())
        .execute(self.pool)
        .await?;

        Ok(())
    }
}

/// Queue an outgoing webmention and drive its delivery, persisting every
/// transition. The target's host becomes a trusted domain: contacting a
/// site is what makes its future webmentions vouch-eligible.
#[tracing::instrument(skip(pool, http), fields(source = %source, target = %target))]
pub async fn queue_webmention(
    pool: &SqlitePool,
    http: &reqwest::Client,
    source: String,
    target: String,
) {
    let uuid = Uuid::new_v4();
    let now = Utc::now();

    let queued = sqlx::query(
        r#"
INSERT INTO outgoing_webmentions (
    uuid,
    source,
    target,
    vouch,
    status,
    message,
    created_at,
    last_modified_at
)
VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, ?6)
ON CONFLICT (source, target) DO UPDATE SET
    status = excluded.status,
    message = excluded.message,
    last_modified_at = excluded.last_modified_at
RETURNING uuid;
        "#,
    )
    .bind(uuid.simple().to_string())
    .bind(&source)
    .bind(&target)
    .bind(WebmentionStatus::Processing.as_str())
    .bind(PROCESSING_MESSAGE)
    .bind(now)
    .fetch_one(pool)
    .await
    .and_then(|row| row.try_get::<String, _>("uuid"));

    let row_uuid = match queued {
        Ok(row_uuid) => Uuid::parse_str(&row_uuid).unwrap_or(uuid),
        Err(e) => {
            tracing::error!(error.cause_chain = ?e, "failed to queue webmention");
            return;
        }
    };

    if let Some(domain) = host_of(&target) {
        if let Err(e) = sqlx::query("INSERT OR IGNORE INTO trusted_domains (domain) VALUES (?1);")
            .bind(domain)
            .execute(pool)
            .await
        {
            tracing::error!(error.cause_chain = ?e, "failed to record trusted domain");
        }
    }

    let log = OutgoingLog {
        pool,
        uuid: row_uuid,
    };
    if let Err(e) = deliver(pool, http, &source, &target, &log, PollSchedule::default()).await {
        tracing::error!(error.cause_chain = ?e, "webmention delivery failed");
    }
}

/// Retry-and-backoff schedule for polling a 201 status page. The defaults
/// give 10 tries, from 1 minute up to 8.5 hours.
pub struct PollSchedule {
    pub retries: u32,
    pub interval: Duration,
    pub backoff: f64,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            retries: 10,
            interval: Duration::from_secs(60),
            backoff: 2.0,
        }
    }
}

/// Discover the webmention endpoint of a target.
///
/// A `HEAD` request is tried first for the `Link` header; if that yields
/// nothing and the page is HTML, the first `<link>` or `<a>` with
/// `rel="webmention"` wins.
pub async fn find_endpoint(http: &reqwest::Client, target: &str) -> Option<String> {
    let scheme = target.split("://").next().unwrap_or("");
    if scheme != "http" && scheme != "https" {
        return None;
    }

    let response = http
        .head(target)
        .header(reqwest::header::USER_AGENT, "Webmention")
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .ok()?;

    for value in response.headers().get_all(reqwest::header::LINK) {
        if let Ok(value) = value.to_str() {
            for link in parse_link_header(value) {
                if link.rels.iter().any(|rel| rel == "webmention") {
                    return Some(urljoin(target, &link.url));
                }
            }
        }
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if !content_type.contains("text/html") {
        return None;
    }

    let response = http
        .get(target)
        .header(reqwest::header::USER_AGENT, "Webmention")
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .ok()?;
    let body = response.text().await.ok()?;

    let html = Html::parse_document(&body);
    let selector = Selector::parse(r#"link[rel~="webmention"][href], a[rel~="webmention"][href]"#)
        .expect("selector is valid");
    html.select(&selector)
        .next()
        .and_then(|element| element.value().attr("href"))
        .map(|href| urljoin(target, href))
}

/// The delivery state machine for a single target.
///
/// A 449 response triggers at most one vouch search; when a vouch is found
/// the delivery restarts with it attached.
async fn deliver(
    pool: &SqlitePool,
    http: &reqwest::Client,
    source: &str,
    target: &str,
    log: &OutgoingLog<'_>,
    schedule: PollSchedule,
) -> anyhow::Result<()> {
    let mut vouch: Option<String> = None;

    loop {
        let Some(endpoint) = find_endpoint(http, target).await else {
            log.record(
                WebmentionStatus::NoEndpoint,
                "The target does not support webmentions.",
                vouch.as_deref(),
            )
            .await?;
            return Ok(());
        };

        let mut payload = vec![("source", source), ("target", target)];
        if let Some(ref vouch) = vouch {
            payload.push(("vouch", vouch.as_str()));
        }

        let response = match http.post(&endpoint).form(&payload).send().await {
            Ok(response) => response,
            Err(e) => {
                log.record(
                    WebmentionStatus::Failure,
                    &format!("The webmention failed: {e}"),
                    None,
                )
                .await?;
                return Ok(());
            }
        };

        match response.status().as_u16() {
            200 => {
                log.record(
                    WebmentionStatus::Success,
                    "The webmention was successfully sent.",
                    vouch.as_deref(),
                )
                .await?;
                return Ok(());
            }
            202 => {
                log.record(
                    WebmentionStatus::Success,
                    "The webmention was accepted.",
                    vouch.as_deref(),
                )
                .await?;
                return Ok(());
            }
            201 => {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .map(|location| urljoin(&endpoint, location));
                match location {
                    Some(location) => {
                        poll_webmention(http, &location, log, vouch.as_deref(), &schedule).await?;
                    }
                    None => {
                        log.record(
                            WebmentionStatus::Failure,
                            "The webmention returned 201 without a Location header.",
                            None,
                        )
                        .await?;
                    }
                }
                return Ok(());
            }
            449 if vouch.is_none() => {
                match find_vouch(pool, http, source, target).await? {
                    Some(found) => {
                        // try again, this time with a vouch
                        vouch = Some(found);
                        continue;
                    }
                    None => {
                        log.record(
                            WebmentionStatus::Failure,
                            "The webmention failed and no vouch URL was found.",
                            None,
                        )
                        .await?;
                        return Ok(());
                    }
                }
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                // do not store the vouch if one was used
                log.record(
                    WebmentionStatus::Failure,
                    &format!("The webmention failed: {body}"),
                    None,
                )
                .await?;
                return Ok(());
            }
        }
    }
}

/// Poll a webmention status page until it reports success or the schedule
/// is exhausted.
async fn poll_webmention(
    http: &reqwest::Client,
    location: &str,
    log: &OutgoingLog<'_>,
    vouch: Option<&str>,
    schedule: &PollSchedule,
) -> anyhow::Result<()> {
    log.record(WebmentionStatus::Processing, PROCESSING_MESSAGE, vouch)
        .await?;

    for retry in 0..schedule.retries {
        let sleep = schedule.interval.as_secs_f64() * schedule.backoff.powi(retry as i32);
        tokio::time::sleep(Duration::from_secs_f64(sleep)).await;

        if let Ok(response) = http.get(location).send().await {
            if response.status() == reqwest::StatusCode::OK {
                log.record(
                    WebmentionStatus::Success,
                    "The webmention was successfully sent.",
                    vouch,
                )
                .await?;
                return Ok(());
            }
        }
    }

    log.record(
        WebmentionStatus::Failure,
        &format!(
            "Gave up on checking webmention status after {} tries.",
            schedule.retries
        ),
        vouch,
    )
    .await?;

    Ok(())
}
