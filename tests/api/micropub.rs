use fake::faker::lorem::en::Sentence;
use fake::Fake;
use quince::feed::new_hentry;
use quince::store::upsert_entry;
use serde_json::json;
use serde_json::Value;

use crate::helpers::spawn_app;
use crate::helpers::TestApp;

async fn create_post(app: &TestApp, token: &str, properties: Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("{}/micropub", app.addr))
        .bearer_auth(token)
        .json(&json!({"type": ["h-entry"], "properties": properties}))
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn config_query_advertises_the_media_endpoint() {
    let app = spawn_app().await;

    let payload: Value = reqwest::Client::new()
        .get(format!("{}/micropub?q=config", app.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(
        payload,
        json!({
            "media-endpoint": "http://example.com/media",
            "syndicate-to": [],
        })
    );
}

#[tokio::test]
async fn unknown_queries_are_invalid_requests() {
    let app = spawn_app().await;

    let response = reqwest::Client::new()
        .get(format!("{}/micropub?q=nonsense", app.addr))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let payload: Value = response.json().await.unwrap();
    assert_eq!(payload["error"], "invalid_request");
    assert!(payload["error_description"]
        .as_str()
        .unwrap()
        .contains("nonsense"));
}

#[tokio::test]
async fn source_query_returns_the_stored_document() {
    let app = spawn_app().await;

    let mut hentry = new_hentry(&app.settings);
    hentry.set_property("content", json!("Hello, world!"));
    hentry.set_property("category", json!("note"));
    let entry = upsert_entry(&app.pool, &hentry).await.unwrap();

    let client = reqwest::Client::new();

    let payload: Value = client
        .get(format!("{}/micropub", app.addr))
        .query(&[("q", "source"), ("url", entry.location.as_str())])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(payload["type"], json!(["h-entry"]));
    assert_eq!(payload["properties"]["content"], json!(["Hello, world!"]));

    // filtered to a subset of properties
    let payload: Value = client
        .get(format!("{}/micropub", app.addr))
        .query(&[
            ("q", "source"),
            ("url", entry.location.as_str()),
            ("properties[]", "category"),
        ])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(payload, json!({"properties": {"category": ["note"]}}));
}

#[tokio::test]
async fn json_create_stores_an_entry() {
    let app = spawn_app().await;
    let token = app.insert_token("create").await;
    let content: String = Sentence(3..8).fake();

    let response = create_post(&app, &token, json!({"content": [content]})).await;

    assert_eq!(response.status(), 201);
    let location = response.headers()["Location"].to_str().unwrap();
    assert!(location.starts_with("http://example.com/feed/"));

    let entry = app.wait_for_entry(location).await;
    assert_eq!(entry.content["properties"]["content"], json!([content]));
    // the skeleton filled in identity properties
    assert!(entry.content["properties"]["uid"][0].is_string());
    assert!(entry.content["properties"]["author"][0]["properties"]["url"][0].is_string());
}

#[tokio::test]
async fn form_create_supports_multi_valued_keys() {
    let app = spawn_app().await;
    let token = app.insert_token("create").await;

    let response = reqwest::Client::new()
        .post(format!("{}/micropub", app.addr))
        .bearer_auth(&token)
        .form(&[
            ("h", "entry"),
            ("content", "A form post"),
            ("category[]", "one"),
            ("category[]", "two"),
        ])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 201);
    let location = response.headers()["Location"].to_str().unwrap();

    let entry = app.wait_for_entry(location).await;
    assert_eq!(entry.content["properties"]["content"], json!(["A form post"]));
    assert_eq!(entry.content["properties"]["category"], json!(["one", "two"]));
}

#[tokio::test]
async fn only_hentries_are_supported() {
    let app = spawn_app().await;
    let token = app.insert_token("create").await;

    let response = reqwest::Client::new()
        .post(format!("{}/micropub", app.addr))
        .bearer_auth(&token)
        .json(&json!({"type": ["h-event"], "properties": {"name": ["Party"]}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 422);

    let response = reqwest::Client::new()
        .post(format!("{}/micropub", app.addr))
        .bearer_auth(&token)
        .form(&[("h", "event"), ("name", "Party")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 422);
}

#[tokio::test]
async fn create_requires_a_token_with_the_create_scope() {
    let app = spawn_app().await;

    // no token
    let response = reqwest::Client::new()
        .post(format!("{}/micropub", app.addr))
        .json(&json!({"type": ["h-entry"], "properties": {"content": ["x"]}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    assert_eq!(response.text().await.unwrap(), "invalid_token");

    // wrong scope
    let token = app.insert_token("read").await;
    let response = create_post(&app, &token, json!({"content": ["x"]})).await;
    assert_eq!(response.status(), 403);
    assert_eq!(response.text().await.unwrap(), "insufficient_scope");
}

#[tokio::test]
async fn update_replaces_adds_and_deletes_properties() {
    let app = spawn_app().await;
    let create = app.insert_token("create").await;
    let update = app.insert_token("update").await;

    let response = create_post(
        &app,
        &create,
        json!({
            "content": ["original"],
            "category": ["one", "two"],
            "summary": ["to be removed"],
        }),
    )
    .await;
    let location = response.headers()["Location"].to_str().unwrap().to_string();

    let response = reqwest::Client::new()
        .post(format!("{}/micropub", app.addr))
        .bearer_auth(&update)
        .json(&json!({
            "action": "update",
            "url": location,
            "replace": {"content": ["revised"]},
            "add": {"category": ["three"]},
            "delete": {"summary": ["to be removed"]},
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 204);

    let entry = app.wait_for_entry(&location).await;
    assert_eq!(entry.content["properties"]["content"], json!(["revised"]));
    assert_eq!(
        entry.content["properties"]["category"],
        json!(["one", "two", "three"])
    );
    // deleting the last value drops the property entirely
    assert!(entry.content["properties"].get("summary").is_none());
    assert!(entry.content["properties"]["updated"][0].is_string());
}

#[tokio::test]
async fn update_of_a_missing_entry_is_a_404() {
    let app = spawn_app().await;
    let token = app.insert_token("update").await;

    let response = reqwest::Client::new()
        .post(format!("{}/micropub", app.addr))
        .bearer_auth(&token)
        .json(&json!({
            "action": "update",
            "url": "http://example.com/feed/1d4f24cc-8c6a-442e-8a42-bc208cb16534",
            "replace": {"content": ["x"]},
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn delete_and_undelete_flip_the_flag() {
    let app = spawn_app().await;
    let create = app.insert_token("create").await;
    let delete = app.insert_token("delete").await;
    let undelete = app.insert_token("undelete").await;

    let response = create_post(&app, &create, json!({"content": ["here today"]})).await;
    let location = response.headers()["Location"].to_str().unwrap().to_string();
    app.wait_for_entry(&location).await;

    let response = reqwest::Client::new()
        .post(format!("{}/micropub", app.addr))
        .bearer_auth(&delete)
        .json(&json!({"action": "delete", "url": location}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);
    assert!(app.entry_by_location(&location).await.unwrap().deleted);

    // deleted entries are gone from the feed surface
    let response = reqwest::Client::new().get(&location.replace(
        "http://example.com",
        &app.addr,
    )).send().await.unwrap();
    assert_eq!(response.status(), 410);

    let response = reqwest::Client::new()
        .post(format!("{}/micropub", app.addr))
        .bearer_auth(&undelete)
        .json(&json!({"action": "undelete", "url": location}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);
    assert!(!app.entry_by_location(&location).await.unwrap().deleted);
}

#[tokio::test]
async fn unknown_actions_are_invalid_requests() {
    let app = spawn_app().await;
    let token = app.insert_token("create update delete undelete").await;

    let response = reqwest::Client::new()
        .post(format!("{}/micropub", app.addr))
        .bearer_auth(&token)
        .json(&json!({"action": "merge", "url": "http://example.com/feed/x"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let payload: Value = response.json().await.unwrap();
    assert_eq!(payload["error"], "invalid_request");
}

#[tokio::test]
async fn media_uploads_round_trip() {
    let app = spawn_app().await;
    let token = app.insert_token("media").await;

    let bytes: &[u8] = &[0xff, 0xd8, 0xff, 0xe0, 1, 2, 3];
    let part = reqwest::multipart::Part::bytes(bytes.to_vec()).file_name("photo.jpg");
    let form = reqwest::multipart::Form::new().part("file", part);

    let response = reqwest::Client::new()
        .post(format!("{}/media", app.addr))
        .bearer_auth(&token)
        .multipart(form)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 201);
    let location = response.headers()["Location"].to_str().unwrap();
    assert!(location.starts_with("http://example.com/media/"));

    let served = reqwest::Client::new()
        .get(location.replace("http://example.com", &app.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(served.status(), 200);
    assert_eq!(served.headers()["Content-Type"].to_str().unwrap(), "image/jpeg");
    assert_eq!(served.bytes().await.unwrap().as_ref(), bytes);
}

#[tokio::test]
async fn media_upload_requires_a_file_part() {
    let app = spawn_app().await;
    let token = app.insert_token("media").await;

    let form = reqwest::multipart::Form::new().text("note", "no file here");

    let response = reqwest::Client::new()
        .post(format!("{}/media", app.addr))
        .bearer_auth(&token)
        .multipart(form)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let payload: Value = response.json().await.unwrap();
    assert_eq!(payload["error"], "invalid_request");
}
