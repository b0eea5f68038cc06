use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;
use serde_json::json;
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::configuration::Settings;
use crate::domain::Microformats2;
use crate::mf2;
use crate::store;
use crate::urls::host_of;
use crate::urls::RouteTable;
use crate::webmention::find_in_json;
use crate::webmention::links_back;
use crate::webmention::send::send_salmention;
use crate::webmention::RemoteDocument;
use crate::webmention::WebmentionStatus;

pub const RECEIVED_MESSAGE: &str = "The webmention was received and is queued for processing.";
pub const PROCESSING_MESSAGE: &str = "The webmention is being processed.";
pub const SUCCESS_MESSAGE: &str = "The webmention processed successfully and approved.";

pub const MODERATION_MESSAGE: &str = "The webmention was processed, but needs moderation before \
    it can be displayed. Note that this endpoint supports the `vouch` extension to WebMention \
    (https://indieweb.org/Vouch). If a `vouch` URL was not provided the existing webmention \
    should be updated by posting a new webmention with the exact same `source` and `target` \
    URLs, along with the `vouch` URL.";

/// Initial request verification of a webmention: the source must use a
/// scheme we understand, and the target must be a page this site serves.
pub fn verify_request(
    routes: &RouteTable,
    settings: &Settings,
    source: &str,
    target: &str,
) -> Result<(), String> {
    let scheme = source.split("://").next().unwrap_or("");
    if scheme != "http" && scheme != "https" {
        return Err(format!(
            "Invalid scheme (\"{scheme}\") in source. Must be one of: http, https"
        ));
    }

    if !routes.contains(target, &settings.application.base_url) {
        return Err(format!("Target URL (\"{target}\") is not valid."));
    }

    Ok(())
}

/// Persists each status transition of the receive workflow. The row is the
/// durable record a client polls via the status endpoint.
struct IncomingLog<'a> {
    pool: &'a SqlitePool,
    uuid: Uuid,
}

impl IncomingLog<'_> {
    async fn record(
        &self,
        status: WebmentionStatus,
        message: &str,
        content: Option<&Microformats2>,
    ) -> anyhow::Result<()> {
        let content = content.map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"
UPDATE incoming_webmentions
SET
    status = ?1,
    message = ?2,
    content = COALESCE(?3, content),
    last_modified_at = ?4
WHERE
    uuid = ?5;
            "#,
        )
        .bind(status.as_str())
        .bind(message)
        .bind(content)
        .bind(Utc::now())
        .bind(self.uuid.simple().to_string())
        .execute(self.pool)
        .await?;

        // A failure for a webmention we had synthesized an entry for means
        // the source was deleted or no longer links here; hide the entry.
        if status == WebmentionStatus::Failure {
            if let Some(entry) = store::get_entry(self.pool, &self.uuid).await? {
                store::delete_entry(self.pool, &entry).await?;
            }
        }

        Ok(())
    }
}

/// Validate an incoming webmention in the background, persisting status
/// transitions as they happen:
///
/// `received → processing → {success | pending_moderation | failure}`
#[tracing::instrument(skip(pool, http, routes, settings), fields(source = %source, target = %target))]
pub async fn process_webmention(
    pool: SqlitePool,
    http: reqwest::Client,
    routes: std::sync::Arc<RouteTable>,
    settings: Settings,
    uuid: Uuid,
    source: String,
    target: String,
    vouch: Option<String>,
) -> anyhow::Result<()> {
    let log = IncomingLog { pool: &pool, uuid };

    // performed again here, in case the workflow is driven from somewhere
    // other than the receive endpoint
    if let Err(reason) = verify_request(&routes, &settings, &source, &target) {
        log.record(WebmentionStatus::Failure, &reason, None).await?;
        return Ok(());
    }

    log.record(WebmentionStatus::Processing, PROCESSING_MESSAGE, None)
        .await?;

    let response = http
        .get(&source)
        .header(
            reqwest::header::ACCEPT,
            "application/json, text/html;q=0.9, */*;q=0.8",
        )
        .send()
        .await
        .and_then(|response| response.error_for_status());

    let document = match response {
        Ok(response) => RemoteDocument::read(response).await?,
        Err(e) => {
            log.record(
                WebmentionStatus::Failure,
                &format!("Failed to fetch source URL: {e}"),
                None,
            )
            .await?;
            return Ok(());
        }
    };

    if !links_back(&document, &target, false) {
        log.record(
            WebmentionStatus::Failure,
            "The target URL is not mentioned in the source.",
            None,
        )
        .await?;
        return Ok(());
    }

    let mut hentry = webmention_hentry(&document, &source, &target, &uuid);

    if !is_domain_trusted(&pool, &source).await?
        && !is_vouch_valid(&pool, &http, vouch.as_deref(), &source).await?
    {
        // mark the entry as private and wait for the owner's approval
        hentry.set_property("visibility", json!("private"));
        log.record(
            WebmentionStatus::PendingModeration,
            MODERATION_MESSAGE,
            Some(&hentry),
        )
        .await?;
    } else {
        // the mentioned entry gained a reply: re-notify its own targets
        send_salmention(&pool, &http, &settings, &target).await;
        log.record(WebmentionStatus::Success, SUCCESS_MESSAGE, Some(&hentry))
            .await?;
    }

    store::upsert_entry(&pool, &hentry).await?;

    Ok(())
}

/// Synthesize an h-entry for a webmention.
///
/// Prefers a real h-entry found in the source that references the target;
/// falls back to a stub whose content is a linkified anchor of the source.
pub fn webmention_hentry(
    document: &RemoteDocument,
    source: &str,
    target: &str,
    uuid: &Uuid,
) -> Microformats2 {
    let anchor = format!(
        r#"<a rel="nofollow" href="{source}">{source}</a>"#
    );
    let published = document
        .last_modified
        .as_deref()
        .and_then(|value| DateTime::parse_from_rfc2822(value).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let mut hentry: Microformats2 = serde_json::from_value(json!({
        "type": ["h-entry"],
        "properties": {
            "url": [source],
            "uid": [uuid.to_string()],
            "post-status": ["published"],
            "visibility": ["public"],
            "sensitive": ["true"],
            "content": [{
                "html": anchor,
                "value": source,
            }],
            "published": [published.to_rfc3339_opts(SecondsFormat::Micros, true)],
        },
    }))
    .expect("the stub h-entry is well-formed");

    let matcher = |content: &str| content.contains(target);

    if document.is_html() {
        let items = mf2::parse_items(&document.body, &document.url);
        for entry in mf2::filter_by_type(&items, "h-entry") {
            // only the h-entry that actually references the target counts
            let value = serde_json::to_value(&entry).expect("items are serializable");
            if find_in_json(&value, &matcher) {
                for (key, value) in entry.properties {
                    hentry.properties.insert(key, value);
                }
            }
        }
        return hentry;
    }

    if document.is_json() {
        // JSON webmention sources are assumed to be microformats2 trees
        if let Ok(root) = serde_json::from_str::<Value>(&document.body) {
            let mut queue = vec![root];
            while let Some(element) = queue.pop() {
                let Value::Object(ref object) = element else {
                    break;
                };

                if object.get("type") == Some(&json!(["h-entry"]))
                    && find_in_json(&element, &matcher)
                {
                    if let Some(Value::Object(properties)) = object.get("properties") {
                        for (key, value) in properties {
                            hentry.properties.insert(key.clone(), value.clone());
                        }
                    }
                    return hentry;
                }

                if let Some(Value::Array(children)) = object.get("children") {
                    queue.extend(children.iter().cloned());
                }
            }
        }
    }

    hentry
}

/// Check if a given source is from a trusted domain.
pub async fn is_domain_trusted(pool: &SqlitePool, source: &str) -> anyhow::Result<bool> {
    let Some(domain) = host_of(source) else {
        return Ok(false);
    };

    let row = sqlx::query("SELECT 1 FROM trusted_domains WHERE domain = ?1;")
        .bind(domain)
        .fetch_optional(pool)
        .await?;

    Ok(row.is_some())
}

/// Check if we can trust a vouch URL: its host must already be trusted, and
/// the vouch page must mention the source's domain.
pub async fn is_vouch_valid(
    pool: &SqlitePool,
    http: &reqwest::Client,
    vouch: Option<&str>,
    source: &str,
) -> anyhow::Result<bool> {
    let Some(vouch) = vouch else {
        return Ok(false);
    };
    if !is_domain_trusted(pool, vouch).await? {
        return Ok(false);
    }

    let response = http
        .get(vouch)
        .send()
        .await
        .and_then(|response| response.error_for_status());

    match response {
        Ok(response) => {
            let document = RemoteDocument::read(response).await?;
            Ok(links_back(&document, source, true))
        }
        Err(_) => Ok(false),
    }
}
