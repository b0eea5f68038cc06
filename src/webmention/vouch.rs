//! Vouch discovery: when a target demands a vouch (449), we look for a
//! third-party page that both the target links to and that has successfully
//! webmentioned us before.
//!
//! https://indieweb.org/Vouch

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;

use scraper::Html;
use scraper::Selector;
use sqlx::Row;
use sqlx::SqlitePool;
use url::Url;

use crate::urls::host_of;
use crate::urls::urljoin;
use crate::webmention::links_back;
use crate::webmention::RemoteDocument;

/// Find a vouch URL for a webmention to `target`.
///
/// All successful incoming webmentions are grouped by host; the target's
/// site is then crawled looking for an external link into one of those
/// hosts. A candidate only counts if its page still links back to us.
pub async fn find_vouch(
    pool: &SqlitePool,
    http: &reqwest::Client,
    source: &str,
    target: &str,
) -> anyhow::Result<Option<String>> {
    let rows = sqlx::query(
        r#"
SELECT
    source
FROM
    incoming_webmentions
WHERE
    status = 'success'
ORDER BY last_modified_at DESC;
        "#,
    )
    .fetch_all(pool)
    .await?;

    // all the domains that link back to us, with their respective URLs
    let mut domains: HashMap<String, Vec<String>> = HashMap::new();
    for row in &rows {
        let incoming: String = row.try_get("source")?;
        if let Some(domain) = host_of(&incoming) {
            domains.entry(domain).or_default().push(incoming);
        }
    }

    if domains.is_empty() {
        return Ok(None);
    }

    let mut crawler = Crawler::new(target);

    while let Some(external_link) = crawler.next_external_link(http).await {
        let Some(domain) = host_of(&external_link) else {
            continue;
        };
        let Some(candidates) = domains.remove(&domain) else {
            continue;
        };

        for incoming_url in candidates {
            // Confirm that the page still points back to us; it may have
            // been updated or deleted without sending a new webmention.
            let Ok(response) = http.get(&incoming_url).send().await else {
                continue;
            };
            let Ok(document) = RemoteDocument::read(response).await else {
                continue;
            };
            if links_back(&document, source, true) {
                return Ok(Some(incoming_url));
            }
        }

        if domains.is_empty() {
            break;
        }
    }

    Ok(None)
}

/// Breadth-first crawl of a single site, yielding external links as they
/// are discovered. Pages are visited at most once; only internal links are
/// followed.
struct Crawler {
    root: String,
    domain: Option<String>,
    queue: VecDeque<String>,
    visited: HashSet<String>,
    yielded: HashSet<String>,
    pending: VecDeque<String>,
}

impl Crawler {
    fn new(target: &str) -> Self {
        let root = Url::parse(target)
            .map(|mut url| {
                url.set_path("/");
                url.set_query(None);
                url.set_fragment(None);
                url.to_string()
            })
            .unwrap_or_else(|_| target.to_string());

        Self {
            root: root.clone(),
            domain: host_of(target),
            queue: VecDeque::from([root, target.to_string()]),
            visited: HashSet::new(),
            yielded: HashSet::new(),
            pending: VecDeque::new(),
        }
    }

    fn is_internal(&self, href: &str) -> bool {
        match Url::parse(href) {
            Ok(_) => host_of(href) == self.domain,
            // relative URLs stay on the site
            Err(url::ParseError::RelativeUrlWithoutBase) => true,
            Err(_) => false,
        }
    }

    async fn next_external_link(&mut self, http: &reqwest::Client) -> Option<String> {
        loop {
            if let Some(link) = self.pending.pop_front() {
                return Some(link);
            }

            let page = self.queue.pop_front()?;
            if !self.visited.insert(page.clone()) {
                continue;
            }

            let Ok(response) = http.get(&page).send().await else {
                continue;
            };
            let Ok(document) = RemoteDocument::read(response).await else {
                continue;
            };
            if document.is_error() || !document.is_html() {
                continue;
            }

            let html = Html::parse_document(&document.body);

            // any element with an href can surface a vouch candidate, not
            // just anchors (think <link> and <area>)
            let any_href = Selector::parse("[href]").expect("selector is valid");
            for element in html.select(&any_href) {
                let Some(href) = element.value().attr("href") else {
                    continue;
                };
                if !self.is_internal(href) && self.yielded.insert(href.to_string()) {
                    self.pending.push_back(href.to_string());
                }
            }

            // only anchors feed the crawl queue
            let anchors = Selector::parse("a[href]").expect("selector is valid");
            for element in html.select(&anchors) {
                let Some(href) = element.value().attr("href") else {
                    continue;
                };
                if self.is_internal(href) {
                    self.queue.push_back(urljoin(&self.root, href));
                }
            }
        }
    }
}
