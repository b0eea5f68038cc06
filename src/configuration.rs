use std::path::PathBuf;

use config::Config;
use config::ConfigError;
use config::FileFormat;
use serde::Deserialize;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use uuid::Uuid;

/// Server configuration.
#[derive(Clone, Deserialize)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub database: DatabaseSettings,
    pub media: MediaSettings,
    pub page_size: usize,
    /// When set, webmentions without a `vouch` URL are rejected with 449.
    pub require_vouch: bool,
    /// `development` disables outgoing webmentions.
    pub environment: String,
    pub owner: OwnerSettings,
}

#[derive(Clone, Deserialize)]
pub struct ApplicationSettings {
    pub host: String,
    pub port: u16,
    /// Public origin of the site. All canonical post URLs live under it.
    pub base_url: String,
}

#[derive(Clone, Deserialize)]
pub struct DatabaseSettings {
    pub path: PathBuf,
}

#[derive(Clone, Deserialize)]
pub struct MediaSettings {
    pub path: PathBuf,
}

/// The owner's h-card fields. This is a single-author system; `me` is always
/// the site homepage.
#[derive(Clone, Deserialize)]
pub struct OwnerSettings {
    pub name: String,
    pub email: String,
    pub photo_description: String,
    pub note: String,
    pub language: String,
    pub site_name: String,
    pub site_description: String,
}

impl DatabaseSettings {
    pub fn connection(&self) -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
    }
}

impl Settings {
    fn join(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.application.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// The owner's profile URL, used as `me` everywhere.
    pub fn home_url(&self) -> String {
        format!("{}/", self.application.base_url.trim_end_matches('/'))
    }

    pub fn feed_url(&self) -> String { self.join("feed") }

    pub fn entry_url(&self, uuid: &Uuid) -> String { self.join(&format!("feed/{uuid}")) }

    pub fn webmention_url(&self) -> String { self.join("webmention") }

    pub fn webmention_status_url(&self, uuid: &Uuid) -> String {
        self.join(&format!("webmention/{uuid}"))
    }

    pub fn hub_url(&self) -> String { self.join("websub") }

    pub fn micropub_url(&self) -> String { self.join("micropub") }

    pub fn media_url(&self, filename: &str) -> String { self.join(&format!("media/{filename}")) }

    pub fn media_endpoint_url(&self) -> String { self.join("media") }

    pub fn authorization_url(&self) -> String { self.join("auth") }

    pub fn token_url(&self) -> String { self.join("token") }

    pub fn introspection_url(&self) -> String { self.join("introspect") }

    pub fn revocation_url(&self) -> String { self.join("revoke") }

    pub fn userinfo_url(&self) -> String { self.join("userinfo") }

    pub fn metadata_url(&self) -> String { self.join(".well-known/oauth-authorization-server") }

    pub fn photo_url(&self) -> String { self.join("static/photo.jpg") }

    pub fn is_development(&self) -> bool { self.environment.eq_ignore_ascii_case("development") }
}

/// Loads `configuration.yaml`, then applies `QUINCE_`-prefixed environment
/// overrides (e.g. `QUINCE_APPLICATION__PORT=8080`).
pub fn get_configuration() -> Result<Settings, ConfigError> {
    let settings = Config::builder()
        .add_source(config::File::new("configuration.yaml", FileFormat::Yaml))
        .add_source(
            config::Environment::with_prefix("QUINCE")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;
    settings.try_deserialize()
}
