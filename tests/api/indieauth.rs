use chrono::Duration;
use chrono::Utc;
use serde_json::Value;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::Mock;
use wiremock::ResponseTemplate;

use crate::helpers::spawn_app;
use crate::helpers::TestApp;

const CODE_VERIFIER: &str = "zo6yP8H9te4I0lk2Uclcry47yPbTT9jRbdnIZPdMUfazH5iD8vkNw";
const CODE_CHALLENGE: &str = "hjooUY_1tBlE_dBuCKGUK8XuSRrc_zNByH-roC5sIXA";

async fn insert_code(app: &TestApp, code: &str, scope: Option<&str>, expired: bool) {
    let created_at = if expired {
        Utc::now() - Duration::minutes(20)
    } else {
        Utc::now()
    };

    sqlx::query(
        "INSERT INTO oauth_authorization_codes \
         (code, client_id, redirect_uri, scope, code_challenge, code_challenge_method, \
          used, expires_at, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, 'S256', FALSE, ?6, ?7);",
    )
    .bind(code)
    .bind("https://app.example.com/")
    .bind("https://app.example.com/redirect")
    .bind(scope)
    .bind(CODE_CHALLENGE)
    .bind(created_at + Duration::minutes(10))
    .bind(created_at)
    .execute(&app.pool)
    .await
    .unwrap();
}

fn code_exchange_form(code: &str) -> Vec<(&'static str, String)> {
    vec![
        ("grant_type", "authorization_code".to_string()),
        ("code", code.to_string()),
        ("client_id", "https://app.example.com/".to_string()),
        ("redirect_uri", "https://app.example.com/redirect".to_string()),
        ("code_verifier", CODE_VERIFIER.to_string()),
    ]
}

#[tokio::test]
async fn server_metadata_is_complete() {
    let app = spawn_app().await;

    let payload: Value = reqwest::Client::new()
        .get(format!("{}/.well-known/oauth-authorization-server", app.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(payload["issuer"], Value::String(app.settings.metadata_url()));
    assert_eq!(payload["response_types_supported"], serde_json::json!(["code"]));
    assert_eq!(
        payload["code_challenge_methods_supported"],
        serde_json::json!(["S256"])
    );
    assert_eq!(payload["authorization_response_iss_parameter_supported"], true);
    let scopes = payload["scopes_supported"].as_array().unwrap();
    for scope in ["create", "update", "delete", "media", "profile", "email"] {
        assert!(scopes.contains(&Value::String(scope.to_string())));
    }
}

#[tokio::test]
async fn authorization_renders_a_consent_page() {
    let app = spawn_app().await;
    let client_id = format!("{}/", app.remote.uri());

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            r#"
<div class="h-app">
    <a class="u-url p-name" href="/">Example App</a>
</div>
            "#,
            "text/html",
        ))
        .mount(&app.remote)
        .await;

    let response = reqwest::Client::new()
        .get(format!("{}/auth", app.addr))
        .query(&[
            ("response_type", "code"),
            ("client_id", client_id.as_str()),
            ("redirect_uri", format!("{client_id}redirect").as_str()),
            ("state", "1234567890"),
            ("code_challenge", CODE_CHALLENGE),
            ("code_challenge_method", "S256"),
            ("scope", "profile create update"),
            ("me", "https://user.example.net/"),
        ])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let html = response.text().await.unwrap();
    assert!(html.contains("Example App"));
    assert!(html.contains("state=1234567890"));
    assert!(html.contains("iss="));
    assert!(html.contains("code="));
}

#[tokio::test]
async fn authorization_rejects_unknown_response_types_and_methods() {
    let app = spawn_app().await;

    let base_params = [
        ("client_id", "https://app.example.com/"),
        ("redirect_uri", "https://app.example.com/redirect"),
        ("state", "1234567890"),
        ("code_challenge", CODE_CHALLENGE),
    ];

    for (response_type, ccm) in [("token", "S256"), ("code", "plain")] {
        let response = reqwest::Client::new()
            .get(format!("{}/auth", app.addr))
            .query(&base_params)
            .query(&[("response_type", response_type), ("code_challenge_method", ccm)])
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 400);
        assert_eq!(response.text().await.unwrap(), "invalid_request");
    }
}

#[tokio::test]
async fn authorization_rejects_a_foreign_redirect_uri() {
    let app = spawn_app().await;
    let client_id = format!("{}/", app.remote.uri());

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("<p>app</p>", "text/html"))
        .mount(&app.remote)
        .await;

    let response = reqwest::Client::new()
        .get(format!("{}/auth", app.addr))
        .query(&[
            ("response_type", "code"),
            ("client_id", client_id.as_str()),
            ("redirect_uri", "https://evil.example.com/redirect"),
            ("state", "1234567890"),
            ("code_challenge", CODE_CHALLENGE),
            ("code_challenge_method", "S256"),
        ])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    assert_eq!(response.text().await.unwrap(), "invalid_request");
}

#[tokio::test]
async fn registered_redirect_uris_are_accepted() {
    let app = spawn_app().await;
    let client_id = format!("{}/", app.remote.uri());

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            r#"<link rel="redirect_uri" href="https://other.example.com/callback">"#,
            "text/html",
        ))
        .mount(&app.remote)
        .await;

    let response = reqwest::Client::new()
        .get(format!("{}/auth", app.addr))
        .query(&[
            ("response_type", "code"),
            ("client_id", client_id.as_str()),
            ("redirect_uri", "https://other.example.com/callback"),
            ("state", "xyz"),
            ("code_challenge", CODE_CHALLENGE),
            ("code_challenge_method", "S256"),
        ])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn profile_exchange_returns_the_profile_url() {
    let app = spawn_app().await;
    insert_code(&app, "abcdef123456", None, false).await;

    let response = reqwest::Client::new()
        .post(format!("{}/auth", app.addr))
        .form(&code_exchange_form("abcdef123456"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let payload: Value = response.json().await.unwrap();
    assert_eq!(payload, serde_json::json!({"me": "http://example.com/"}));
}

#[tokio::test]
async fn an_expired_code_is_an_invalid_grant() {
    let app = spawn_app().await;
    insert_code(&app, "abcdef123456", None, true).await;

    let response = reqwest::Client::new()
        .post(format!("{}/auth", app.addr))
        .form(&code_exchange_form("abcdef123456"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    assert_eq!(response.text().await.unwrap(), "invalid_grant");
}

#[tokio::test]
async fn codes_are_single_use() {
    let app = spawn_app().await;
    insert_code(&app, "abcdef123456", None, false).await;

    let client = reqwest::Client::new();
    let first = client
        .post(format!("{}/auth", app.addr))
        .form(&code_exchange_form("abcdef123456"))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);

    let second = client
        .post(format!("{}/auth", app.addr))
        .form(&code_exchange_form("abcdef123456"))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 400);
    assert_eq!(second.text().await.unwrap(), "invalid_grant");
}

#[tokio::test]
async fn a_wrong_verifier_is_an_invalid_grant() {
    let app = spawn_app().await;
    insert_code(&app, "abcdef123456", Some("read"), false).await;

    let mut form = code_exchange_form("abcdef123456");
    form.retain(|(key, _)| *key != "code_verifier");
    form.push(("code_verifier", "not-the-right-verifier".to_string()));

    let response = reqwest::Client::new()
        .post(format!("{}/token", app.addr))
        .form(&form)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    assert_eq!(response.text().await.unwrap(), "invalid_grant");
}

#[tokio::test]
async fn token_exchange_with_pkce_mints_a_token_pair() {
    let app = spawn_app().await;
    insert_code(&app, "abcdef123456", Some("read email profile"), false).await;

    let response = reqwest::Client::new()
        .post(format!("{}/token", app.addr))
        .form(&code_exchange_form("abcdef123456"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let payload: Value = response.json().await.unwrap();

    let access_token = payload["access_token"].as_str().unwrap();
    let refresh_token = payload["refresh_token"].as_str().unwrap();
    assert!(access_token.starts_with("ra_"));
    assert_eq!(access_token.len(), 35);
    assert!(refresh_token.starts_with("rr_"));
    assert_eq!(payload["expires_in"], 3600);
    assert_eq!(payload["token_type"], "Bearer");
    assert_eq!(payload["me"], "http://example.com/");
    assert_eq!(payload["scope"], "read email profile");
    assert_eq!(payload["profile"]["name"], app.settings.owner.name);
    assert_eq!(payload["profile"]["email"], app.settings.owner.email);

    // the pair is persisted
    let row = app.token_row(access_token).await.unwrap();
    assert_eq!(row.scope, "read email profile");
    assert!(row.expires_at > Utc::now());
}

#[tokio::test]
async fn token_exchange_without_scope_is_rejected() {
    let app = spawn_app().await;
    insert_code(&app, "abcdef123456", None, false).await;

    let response = reqwest::Client::new()
        .post(format!("{}/token", app.addr))
        .form(&code_exchange_form("abcdef123456"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    assert_eq!(response.text().await.unwrap(), "invalid_request");
}

#[tokio::test]
async fn grant_dispatching() {
    let app = spawn_app().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/token", app.addr))
        .form(&[("grant_type", "magic_link"), ("code", "x")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert_eq!(response.text().await.unwrap(), "unsupported_grant_type");

    let response = client
        .post(format!("{}/token", app.addr))
        .form(&[("code", "x")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert_eq!(response.text().await.unwrap(), "invalid_request");
}

#[tokio::test]
async fn refresh_rotates_the_pair_and_preserves_created_at() {
    let app = spawn_app().await;
    insert_code(&app, "abcdef123456", Some("read email profile"), false).await;

    let client = reqwest::Client::new();
    let payload: Value = client
        .post(format!("{}/token", app.addr))
        .form(&code_exchange_form("abcdef123456"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let old_access = payload["access_token"].as_str().unwrap().to_string();
    let old_refresh = payload["refresh_token"].as_str().unwrap().to_string();
    let old_row = app.token_row(&old_access).await.unwrap();

    let refreshed: Value = client
        .post(format!("{}/token", app.addr))
        .form(&[
            ("grant_type", "refresh_token"),
            ("client_id", "https://app.example.com/"),
            ("refresh_token", old_refresh.as_str()),
        ])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let new_access = refreshed["access_token"].as_str().unwrap();
    assert!(new_access.starts_with("ra_"));
    assert_ne!(new_access, old_access);
    assert_eq!(refreshed["scope"], "read email profile");
    assert!(refreshed.get("me").is_none());

    // the old pair is gone, the new row keeps the original created_at
    assert!(app.token_row(&old_access).await.is_none());
    let new_row = app.token_row(new_access).await.unwrap();
    assert_eq!(new_row.created_at, old_row.created_at);
    assert!(new_row.expires_at >= old_row.expires_at);
    assert!(new_row.last_refresh_at >= old_row.last_refresh_at);
}

#[tokio::test]
async fn refresh_may_narrow_but_never_widen_the_scope() {
    let app = spawn_app().await;
    let access = app.insert_token("read email profile").await;
    let refresh = app.refresh_token_of(&access).await;

    let client = reqwest::Client::new();

    // widening is refused
    let response = client
        .post(format!("{}/token", app.addr))
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh.as_str()),
            ("scope", "read write update"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert_eq!(response.text().await.unwrap(), "invalid_scope");

    // narrowing sticks
    let refreshed: Value = client
        .post(format!("{}/token", app.addr))
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh.as_str()),
            ("scope", "read"),
        ])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(refreshed["scope"], "read");

    let narrowed = app
        .token_row(refreshed["access_token"].as_str().unwrap())
        .await
        .unwrap();
    assert_eq!(narrowed.scope, "read");
}

#[tokio::test]
async fn an_unknown_refresh_token_is_an_invalid_grant() {
    let app = spawn_app().await;

    let response = reqwest::Client::new()
        .post(format!("{}/token", app.addr))
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", "rr_00000000000000000000000000000000"),
        ])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    assert_eq!(response.text().await.unwrap(), "invalid_grant");
}

#[tokio::test]
async fn introspection_reports_active_tokens() {
    let app = spawn_app().await;
    let access = app.insert_token("read").await;

    let payload: Value = reqwest::Client::new()
        .post(format!("{}/introspect", app.addr))
        .form(&[("token", access.as_str())])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(payload["active"], true);
    assert_eq!(payload["me"], "http://example.com/");
    assert_eq!(payload["client_id"], "https://app.example.com/");
    assert_eq!(payload["scope"], "read");
    assert!(payload["exp"].as_i64().unwrap() > payload["iat"].as_i64().unwrap());
}

#[tokio::test]
async fn introspection_of_unknown_or_expired_tokens_is_inactive() {
    let app = spawn_app().await;

    let payload: Value = reqwest::Client::new()
        .post(format!("{}/introspect", app.addr))
        .form(&[("token", "ra_ffffffffffffffffffffffffffffffff")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(payload, serde_json::json!({"active": false}));

    // revoke an active token, then introspect it
    let access = app.insert_token("read").await;
    reqwest::Client::new()
        .post(format!("{}/revoke", app.addr))
        .form(&[("token", access.as_str())])
        .send()
        .await
        .unwrap();

    let payload: Value = reqwest::Client::new()
        .post(format!("{}/introspect", app.addr))
        .form(&[("token", access.as_str())])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(payload, serde_json::json!({"active": false}));
}

#[tokio::test]
async fn revoking_an_unknown_token_still_succeeds() {
    let app = spawn_app().await;

    let response = reqwest::Client::new()
        .post(format!("{}/revoke", app.addr))
        .form(&[("token", "hello!")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // the legacy query form is accepted too
    let response = reqwest::Client::new()
        .post(format!("{}/revoke?action=revoke", app.addr))
        .form(&[("token", "hello!")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn userinfo_requires_the_profile_scope() {
    let app = spawn_app().await;

    // happy path
    let access = app.insert_token("read email profile").await;
    let response = reqwest::Client::new()
        .get(format!("{}/userinfo", app.addr))
        .bearer_auth(&access)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let payload: Value = response.json().await.unwrap();
    assert_eq!(payload["name"], app.settings.owner.name);
    assert_eq!(payload["url"], "http://example.com/");
    assert_eq!(payload["email"], app.settings.owner.email);

    // missing scope
    let access = app.insert_token("read").await;
    let response = reqwest::Client::new()
        .get(format!("{}/userinfo", app.addr))
        .bearer_auth(&access)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
    assert_eq!(response.text().await.unwrap(), "insufficient_scope");

    // no token at all
    let response = reqwest::Client::new()
        .get(format!("{}/userinfo", app.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    assert_eq!(response.text().await.unwrap(), "invalid_token");
}
