use serde_json::json;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::Match;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::Request;
use wiremock::ResponseTemplate;

use crate::helpers::spawn_app_with;
use crate::helpers::TestApp;

/// Matches webmention delivery POSTs that do not carry a vouch.
struct LacksVouch;

impl Match for LacksVouch {
    fn matches(&self, request: &Request) -> bool {
        let body = std::str::from_utf8(&request.body).unwrap_or("");
        !body.contains("vouch=")
    }
}

/// Create a post through Micropub whose content mentions `target`, and
/// return its canonical URL.
async fn publish_mentioning(app: &TestApp, target: &str) -> String {
    let token = app.insert_token("create").await;

    let response = reqwest::Client::new()
        .post(format!("{}/micropub", app.addr))
        .bearer_auth(token)
        .json(&json!({
            "type": ["h-entry"],
            "properties": {
                "content": [format!("As {target} says.")],
            },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    response.headers()["Location"].to_str().unwrap().to_string()
}

#[tokio::test]
async fn a_new_post_notifies_its_targets() {
    // outgoing webmentions only run outside development; pointing the base
    // URL at a mock server keeps incidental fetches local
    let site = MockServer::start().await;
    let app = spawn_app_with(|cfg| {
        cfg.environment = "production".to_string();
        cfg.application.base_url = site.uri();
    })
    .await;

    let target = format!("{}/post/42", app.remote.uri());
    let endpoint_path = "/webmention-endpoint";

    Mock::given(method("HEAD"))
        .and(path("/post/42"))
        .respond_with(ResponseTemplate::new(200).insert_header(
            "Link",
            format!(r#"<{endpoint_path}>; rel="webmention""#).as_str(),
        ))
        .mount(&app.remote)
        .await;
    Mock::given(method("POST"))
        .and(path(endpoint_path))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&app.remote)
        .await;

    let source = publish_mentioning(&app, &target).await;

    let (status, message, _vouch) = app.wait_for_outgoing(&source, &target).await;
    assert_eq!(status, "success");
    assert!(message.contains("successfully sent"));

    // contacting the target made its host vouch-eligible
    let host = url::Url::parse(&target).unwrap();
    let domain = format!("{}:{}", host.host_str().unwrap(), host.port().unwrap());
    let row = sqlx::query("SELECT 1 FROM trusted_domains WHERE domain = ?1;")
        .bind(domain)
        .fetch_optional(&app.pool)
        .await
        .unwrap();
    assert!(row.is_some());
}

#[tokio::test]
async fn an_accepted_delivery_counts_as_success() {
    let site = MockServer::start().await;
    let app = spawn_app_with(|cfg| {
        cfg.environment = "production".to_string();
        cfg.application.base_url = site.uri();
    })
    .await;

    let target = format!("{}/post/42", app.remote.uri());

    Mock::given(method("HEAD"))
        .and(path("/post/42"))
        .respond_with(ResponseTemplate::new(200).insert_header(
            "Link",
            r#"</webmention>; rel="webmention""#,
        ))
        .mount(&app.remote)
        .await;
    Mock::given(method("POST"))
        .and(path("/webmention"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&app.remote)
        .await;

    let source = publish_mentioning(&app, &target).await;

    let (status, message, _) = app.wait_for_outgoing(&source, &target).await;
    assert_eq!(status, "success");
    assert!(message.contains("accepted"));
}

#[tokio::test]
async fn a_target_without_an_endpoint_is_terminal() {
    let site = MockServer::start().await;
    let app = spawn_app_with(|cfg| {
        cfg.environment = "production".to_string();
        cfg.application.base_url = site.uri();
    })
    .await;

    let target = format!("{}/post/42", app.remote.uri());

    Mock::given(method("HEAD"))
        .and(path("/post/42"))
        .respond_with(ResponseTemplate::new(200).insert_header("Content-Type", "text/html"))
        .mount(&app.remote)
        .await;
    Mock::given(method("GET"))
        .and(path("/post/42"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw("<p>no endpoint here</p>", "text/html"),
        )
        .mount(&app.remote)
        .await;

    let source = publish_mentioning(&app, &target).await;

    let (status, message, _) = app.wait_for_outgoing(&source, &target).await;
    assert_eq!(status, "no_endpoint");
    assert!(message.contains("does not support"));
}

#[tokio::test]
async fn a_449_finds_a_vouch_and_retries() {
    let site = MockServer::start().await;
    // bob (the target) and carol (a previous mentioner) live on separate
    // servers so the crawler sees carol's link as external
    let bob = MockServer::start().await;
    let carol = MockServer::start().await;

    let app = spawn_app_with(|cfg| {
        cfg.environment = "production".to_string();
        cfg.application.base_url = site.uri();
    })
    .await;

    let target = format!("{}/post/42", bob.uri());
    let carol_url = format!("{}/post/2", carol.uri());

    // carol has successfully webmentioned us before
    app.insert_incoming_webmention(&carol_url, &format!("{}/feed/x", site.uri()), "success")
        .await;

    // bob's endpoint demands a vouch on the first, bare attempt
    Mock::given(method("HEAD"))
        .and(path("/post/42"))
        .respond_with(ResponseTemplate::new(200).insert_header(
            "Link",
            r#"</webmention>; rel="webmention""#,
        ))
        .mount(&bob)
        .await;
    Mock::given(method("POST"))
        .and(path("/webmention"))
        .and(LacksVouch)
        .respond_with(ResponseTemplate::new(449))
        .mount(&bob)
        .await;
    Mock::given(method("POST"))
        .and(path("/webmention"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&bob)
        .await;

    // crawling bob's site reveals a link to carol
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            format!(r#"<a href="{carol_url}">carol</a>"#),
            "text/html",
        ))
        .mount(&bob)
        .await;
    Mock::given(method("GET"))
        .and(path("/post/42"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("<p>bob's post</p>", "text/html"))
        .mount(&bob)
        .await;

    // carol's page still links to our site (domain granularity)
    Mock::given(method("GET"))
        .and(path("/post/2"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            format!(r#"<a href="{}/feed/x">a post I liked</a>"#, site.uri()),
            "text/html",
        ))
        .mount(&carol)
        .await;

    let source = publish_mentioning(&app, &target).await;

    let (status, _message, vouch) = app.wait_for_outgoing(&source, &target).await;
    assert_eq!(status, "success");
    assert_eq!(vouch.as_deref(), Some(carol_url.as_str()));
}

#[tokio::test]
async fn development_environment_sends_nothing() {
    let app = spawn_app_with(|cfg| cfg.environment = "development".to_string()).await;

    let target = format!("{}/post/42", app.remote.uri());
    let source = publish_mentioning(&app, &target).await;

    // give any (incorrect) background delivery a moment to appear
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;

    let row = sqlx::query("SELECT 1 FROM outgoing_webmentions WHERE source = ?1;")
        .bind(&source)
        .fetch_optional(&app.pool)
        .await
        .unwrap();
    assert!(row.is_none());
}
