//! IndieAuth server helpers: PKCE, the scope catalog, token generation, and
//! client information discovery.
//!
//! https://indieauth.spec.indieweb.org/

use std::collections::HashSet;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::Digest;
use sha2::Sha256;
use uuid::Uuid;

use crate::mf2;
use crate::urls::parse_link_header;
use crate::urls::urljoin;

pub const RESPONSE_TYPES_SUPPORTED: [&str; 1] = ["code"];
pub const GRANT_TYPES_SUPPORTED: [&str; 2] = ["authorization_code", "refresh_token"];
pub const CODE_CHALLENGE_METHODS_SUPPORTED: [&str; 1] = ["S256"];

/// The capability catalog: micropub, microsub, and identity scopes.
pub const SCOPES_SUPPORTED: [&str; 13] = [
    "create", "draft", "update", "delete", "undelete", "media", "read", "follow", "mute", "block",
    "channels", "profile", "email",
];

/// Authorization codes are single-use and short-lived.
pub fn code_expires_in() -> chrono::Duration { chrono::Duration::minutes(10) }

/// Access tokens live for an hour; refreshing extends the pair.
pub fn token_expires_in() -> chrono::Duration { chrono::Duration::hours(1) }

pub fn new_authorization_code() -> String { Uuid::new_v4().simple().to_string() }

pub fn new_access_token() -> String { format!("ra_{}", Uuid::new_v4().simple()) }

pub fn new_refresh_token() -> String { format!("rr_{}", Uuid::new_v4().simple()) }

/// Compute the S256 challenge from the code verifier.
///
/// https://tools.ietf.org/html/rfc7636#section-4.2
pub fn compute_s256_challenge(code_verifier: &str) -> String {
    let digest = Sha256::digest(code_verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Check a PKCE verifier against the stored challenge.
pub fn verify_challenge(challenge: &str, method: &str, verifier: &str) -> bool {
    match method {
        "S256" => compute_s256_challenge(verifier) == challenge,
        "plain" => verifier == challenge,
        _ => false,
    }
}

/// Whether every requested scope was present in the original grant.
pub fn scope_is_subset(requested: &str, original: &str) -> bool {
    let original: HashSet<&str> = original.split_whitespace().collect();
    requested.split_whitespace().all(|scope| original.contains(scope))
}

/// What we learned about an IndieAuth client by dereferencing its
/// `client_id`.
#[derive(Clone, Debug)]
pub struct ClientInfo {
    pub name: String,
    pub url: String,
    pub image: Option<String>,
    pub redirect_uris: HashSet<String>,
}

/// Fetch the client's page and extract its h-app/h-x-app card and the set of
/// registered redirect URIs (from `Link` headers and `<link>` elements).
pub async fn get_client_info(
    http: &reqwest::Client,
    client_id: &str,
) -> anyhow::Result<ClientInfo> {
    let response = http.get(client_id).send().await?;

    let mut redirect_uris = HashSet::new();
    for value in response.headers().get_all(reqwest::header::LINK) {
        if let Ok(value) = value.to_str() {
            for link in parse_link_header(value) {
                if link.rels.iter().any(|rel| rel == "redirect_uri") {
                    redirect_uris.insert(urljoin(client_id, &link.url));
                }
            }
        }
    }

    let html = response.text().await?;

    let items = mf2::parse_items(&html, client_id);
    let card = items.iter().find(|item| {
        item.is_type("h-app") || item.is_type("h-x-app") || item.is_type("h-card")
    });

    let name = card
        .and_then(|card| card.property_str("name"))
        .unwrap_or(client_id)
        .to_string();
    let url = card
        .and_then(|card| card.property_str("url"))
        .map(|url| urljoin(client_id, url))
        .unwrap_or_else(|| client_id.to_string());
    let image = card
        .and_then(|card| {
            card.property_str("logo").or_else(|| card.property_str("photo"))
        })
        .map(|url| urljoin(client_id, url));

    // <link rel="redirect_uri" href="..."> entries count too
    let document = scraper::Html::parse_document(&html);
    let selector = scraper::Selector::parse(r#"link[rel~="redirect_uri"]"#)
        .expect("selector is valid");
    for element in document.select(&selector) {
        if let Some(href) = element.value().attr("href") {
            redirect_uris.insert(urljoin(client_id, href));
        }
    }

    Ok(ClientInfo {
        name,
        url,
        image,
        redirect_uris,
    })
}
