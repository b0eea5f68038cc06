use linkify::LinkFinder;
use linkify::LinkKind;
use url::Url;
use uuid::Uuid;

/// Apply URL canonicalization.
///
/// https://indieauth.spec.indieweb.org/#url-canonicalization
pub fn canonicalize_url(url: &str) -> String {
    let with_scheme = if url.contains("://") {
        url.to_string()
    } else {
        format!("https://{url}")
    };

    match Url::parse(&with_scheme) {
        // `Url` already lowercases the host and defaults the path to "/"
        Ok(parsed) => parsed.to_string(),
        Err(_) => with_scheme,
    }
}

/// Extract URLs from free-form text.
pub fn find_urls(text: &str) -> Vec<String> {
    LinkFinder::new()
        .links(text)
        .filter(|link| *link.kind() == LinkKind::Url)
        .map(|link| link.as_str().to_string())
        .collect()
}

/// Compare two URLs, either exactly or at host granularity.
pub fn url_matches(left: &str, right: &str, domain_only: bool) -> bool {
    let (Ok(left), Ok(right)) = (Url::parse(left), Url::parse(right)) else {
        return false;
    };

    if domain_only {
        left.host_str() == right.host_str() && left.port_or_known_default() == right.port_or_known_default()
    } else {
        left == right
    }
}

/// The host ("netloc") of a URL, with any explicit port.
pub fn host_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_string();
    Some(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    })
}

/// Append (or replace) a query parameter on a URL.
pub fn with_query_param(url: &str, key: &str, value: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            let others: Vec<(String, String)> = parsed
                .query_pairs()
                .filter(|(k, _)| k != key)
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            {
                let mut pairs = parsed.query_pairs_mut();
                pairs.clear();
                for (k, v) in &others {
                    pairs.append_pair(k, v);
                }
                pairs.append_pair(key, value);
            }
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}

/// One parsed `Link` header entry.
pub struct LinkHeader {
    pub url: String,
    pub rels: Vec<String>,
}

/// Parse an HTTP `Link` header value (`<url>; rel="webmention", ...`).
pub fn parse_link_header(value: &str) -> Vec<LinkHeader> {
    let mut links = Vec::new();

    for part in split_links(value) {
        let mut segments = part.split(';');
        let Some(target) = segments.next() else {
            continue;
        };
        let target = target.trim();
        if !target.starts_with('<') || !target.ends_with('>') {
            continue;
        }
        let url = target[1..target.len() - 1].to_string();

        let mut rels = Vec::new();
        for param in segments {
            let Some((key, raw)) = param.split_once('=') else {
                continue;
            };
            if key.trim() != "rel" {
                continue;
            }
            let raw = raw.trim().trim_matches('"');
            rels.extend(raw.split_whitespace().map(String::from));
        }

        links.push(LinkHeader { url, rels });
    }

    links
}

// Commas may appear inside quoted parameters; only split on commas that
// precede a new `<url>` entry.
fn split_links(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;

    for (i, c) in value.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                let rest = value[i + 1..].trim_start();
                if rest.starts_with('<') {
                    parts.push(&value[start..i]);
                    start = i + 1;
                }
            }
            _ => {}
        }
    }
    parts.push(&value[start..]);

    parts
}

/// Resolve `href` against `base`, like a browser would.
pub fn urljoin(base: &str, href: &str) -> String {
    match Url::parse(base).and_then(|base| base.join(href)) {
        Ok(url) => url.to_string(),
        Err(_) => href.to_string(),
    }
}

#[derive(Clone, Copy)]
enum Segment {
    Literal(&'static str),
    Uuid,
    Any,
}

/// A compiled set of the application's GET-able path patterns, consulted by
/// the webmention engine to decide whether a `target` URL points at a page
/// this site serves. Kept separate from the actix route table on purpose:
/// workflows must not reach into the framework's router.
pub struct RouteTable {
    routes: Vec<Vec<Segment>>,
}

impl RouteTable {
    /// The publicly reachable pages of this site.
    pub fn new() -> Self {
        let parse = |pattern: &'static str| -> Vec<Segment> {
            pattern
                .split('/')
                .filter(|s| !s.is_empty())
                .map(|s| match s {
                    "{uuid}" => Segment::Uuid,
                    "{any}" => Segment::Any,
                    literal => Segment::Literal(literal),
                })
                .collect()
        };

        Self {
            routes: [
                "/",
                "/health_check",
                "/feed",
                "/feed/{uuid}",
                "/search",
                "/category/{any}",
                "/webmention/{uuid}",
                "/media/{any}",
                "/.well-known/oauth-authorization-server",
            ]
            .into_iter()
            .map(parse)
            .collect(),
        }
    }

    /// Whether `url` resolves to a route in this application.
    pub fn contains(&self, url: &str, base_url: &str) -> bool {
        let base = base_url.trim_end_matches('/');
        let Some(rest) = url.strip_prefix(base) else {
            return false;
        };
        let path = rest.split(['?', '#']).next().unwrap_or("");

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        self.routes.iter().any(|route| Self::matches(route, &segments))
    }

    fn matches(route: &[Segment], segments: &[&str]) -> bool {
        route.len() == segments.len()
            && route.iter().zip(segments).all(|(pattern, segment)| match pattern {
                Segment::Literal(literal) => literal == segment,
                Segment::Uuid => Uuid::parse_str(segment).is_ok(),
                Segment::Any => true,
            })
    }
}

impl Default for RouteTable {
    fn default() -> Self { Self::new() }
}
