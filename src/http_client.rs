use std::time::Duration;

use reqwest::redirect::Policy;
use reqwest::Client;

/// Every outbound call carries a bounded timeout so a slow peer cannot pin a
/// background task.
const TIMEOUT: Duration = Duration::from_secs(30);

/// Shared client for all federation fetches: webmention verification and
/// delivery, vouch crawling, IndieAuth client discovery, and WebSub
/// callbacks. Connections are reused, so this is built once at startup and
/// cloned into handlers and workers.
pub fn federation_client() -> Client {
    Client::builder()
        .timeout(TIMEOUT)
        .redirect(Policy::limited(10))
        .build()
        .expect("failed to build HTTP client")
}
