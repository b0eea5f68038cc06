//! Builders for the site's own microformats objects: the owner h-card, the
//! h-feed served as the WebSub topic, and the skeleton h-entry new posts
//! start from.

use chrono::SecondsFormat;
use chrono::Utc;
use serde_json::json;
use serde_json::Value;
use uuid::Uuid;

use crate::configuration::Settings;
use crate::domain::Entry;
use crate::domain::Microformats2;

/// The owner's h-card.
pub fn owner_hcard(settings: &Settings) -> Microformats2 {
    serde_json::from_value(json!({
        "type": ["h-card"],
        "properties": {
            "name": [settings.owner.name],
            "url": [settings.home_url()],
            "photo": [{
                "alt": settings.owner.photo_description,
                "value": settings.photo_url(),
            }],
            "email": [settings.owner.email],
            "note": [settings.owner.note],
        },
    }))
    .expect("the owner h-card is well-formed")
}

/// A fresh h-entry skeleton: uid, url, timestamps, and the owner as author.
/// Micropub creates start from this and merge the payload's properties over
/// it.
pub fn new_hentry(settings: &Settings) -> Microformats2 {
    let uuid = Uuid::new_v4();
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);

    serde_json::from_value(json!({
        "type": ["h-entry"],
        "properties": {
            "author": [serde_json::to_value(owner_hcard(settings)).unwrap()],
            "published": [now],
            "updated": [now],
            "url": [settings.entry_url(&uuid)],
            "uid": [uuid.to_string()],
        },
    }))
    .expect("the h-entry skeleton is well-formed")
}

/// An entry as it appears inside a feed: `url` and `published` filled in
/// from the row when the content does not carry them.
pub fn hentry_from_entry(entry: &Entry) -> Value {
    let mut hentry = entry.content.clone();

    if !hentry.properties.contains_key("url") {
        hentry.set_property("url", json!(entry.location));
    }
    if !hentry.properties.contains_key("published") {
        hentry.set_property(
            "published",
            json!(entry.last_modified_at.to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
    }

    serde_json::to_value(hentry).expect("entries are serializable")
}

/// ETag for a list of entries: the hash of their canonicalized contents.
pub fn generate_etag(entries: &[Entry]) -> String {
    use sha2::Digest;

    let payload: Vec<Value> = entries
        .iter()
        .map(|entry| serde_json::to_value(&entry.content).expect("entries are serializable"))
        .collect();
    let serialized = serde_json::to_string(&payload).expect("entries are serializable");

    hex::encode(sha2::Sha256::digest(serialized.as_bytes()))
}

/// The h-feed for a list of entries.
pub fn hfeed_from_entries(settings: &Settings, entries: &[Entry], url: &str) -> Value {
    let last_modified_at = entries
        .iter()
        .map(|entry| entry.last_modified_at)
        .max()
        .unwrap_or_else(Utc::now);

    json!({
        "type": ["h-feed"],
        "properties": {
            "name": [settings.owner.site_name],
            "url": [url],
            "summary": [settings.owner.site_description],
            "published": [last_modified_at.to_rfc3339_opts(SecondsFormat::Micros, true)],
            "language": [settings.owner.language],
            "author": [serde_json::to_value(owner_hcard(settings)).unwrap()],
        },
        "children": entries.iter().map(hentry_from_entry).collect::<Vec<_>>(),
    })
}
