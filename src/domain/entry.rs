use chrono::DateTime;
use chrono::Utc;
use uuid::Uuid;

use crate::domain::Microformats2;

/// A stored post: either authored by the site owner or synthesized from an
/// incoming webmention.
#[derive(Clone, Debug)]
pub struct Entry {
    pub uuid: Uuid,
    /// The author's profile URL. For synthesized entries this is the remote
    /// h-card URL (or the source host).
    pub author: String,
    /// Canonical public URL. For owner posts this lives under the site base
    /// URL; for synthesized entries it is the remote source URL.
    pub location: String,
    pub content: Microformats2,
    pub published: bool,
    pub visibility: String,
    pub sensitive: bool,
    pub read: bool,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
}
