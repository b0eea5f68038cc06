use reqwest::Response;
use reqwest::StatusCode;
use scraper::Html;
use serde_json::Value;

use crate::urls::find_urls;
use crate::urls::url_matches;

/// A fetched remote page, read fully into memory so the linkback predicates
/// can be applied without holding the connection open.
pub struct RemoteDocument {
    pub url: String,
    pub status: StatusCode,
    pub content_type: String,
    pub last_modified: Option<String>,
    pub body: String,
}

impl RemoteDocument {
    pub async fn read(response: Response) -> reqwest::Result<Self> {
        let url = response.url().to_string();
        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        let last_modified = response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .map(String::from);
        let body = response.text().await?;

        Ok(Self {
            url,
            status,
            content_type,
            last_modified,
            body,
        })
    }

    pub fn is_error(&self) -> bool {
        self.status.is_client_error() || self.status.is_server_error()
    }

    pub fn is_html(&self) -> bool { self.content_type.contains("text/html") }

    pub fn is_json(&self) -> bool { self.content_type.contains("application/json") }
}

/// Check if the target URL is present in the source document.
///
/// HTML is probed via `href`/`src` attributes, JSON by walking the value
/// tree, and anything else by mining URLs out of the raw text. Error
/// responses never link back.
pub fn links_back(document: &RemoteDocument, target: &str, domain_only: bool) -> bool {
    if document.is_error() {
        return false;
    }

    let matches = |url: &str| url_matches(target, url, domain_only);

    if document.is_html() {
        let html = Html::parse_document(&document.body);
        return html.root_element().descendants().any(|node| {
            node.value().as_element().is_some_and(|element| {
                element
                    .attr("href")
                    .or_else(|| element.attr("src"))
                    .is_some_and(&matches)
            })
        });
    }

    if document.is_json() {
        return serde_json::from_str::<Value>(&document.body)
            .map(|payload| find_in_json(&payload, &matches))
            .unwrap_or(false);
    }

    if !document.content_type.contains("text/plain") {
        tracing::warn!(
            "unknown content type {:?}, falling back to text/plain",
            document.content_type
        );
    }

    find_urls(&document.body).iter().any(|url| matches(url))
}

/// Traverse a JSON value testing every string leaf for a match.
pub fn find_in_json(value: &Value, test: &dyn Fn(&str) -> bool) -> bool {
    match value {
        Value::String(s) => test(s),
        Value::Array(items) => items.iter().any(|item| find_in_json(item, test)),
        Value::Object(map) => map.values().any(|item| find_in_json(item, test)),
        _ => false,
    }
}
