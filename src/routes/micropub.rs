use actix_multipart::Multipart;
use actix_web::http::header::CONTENT_TYPE;
use actix_web::http::header::LOCATION;
use actix_web::http::StatusCode;
use actix_web::web;
use actix_web::web::Data;
use actix_web::HttpRequest;
use actix_web::HttpResponse;
use chrono::SecondsFormat;
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::authentication::AccessGrant;
use crate::configuration::Settings;
use crate::domain::Microformats2;
use crate::events::Event;
use crate::events::EventBus;
use crate::feed::new_hentry;
use crate::store;
use crate::utils::error_500;
use crate::utils::json_error;

/// Query the Micropub endpoint.
pub async fn micropub_query(
    req: HttpRequest,
    pool: Data<SqlitePool>,
    settings: Data<Settings>,
) -> Result<HttpResponse, actix_web::Error> {
    let params: Vec<(String, String)> =
        serde_urlencoded::from_str(req.query_string()).unwrap_or_default();
    let get = |key: &str| {
        params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value.as_str())
    };

    match get("q") {
        Some("config") => Ok(HttpResponse::Ok().json(json!({
            "media-endpoint": settings.media_endpoint_url(),
            "syndicate-to": [],
        }))),
        Some("syndicate-to") => Ok(HttpResponse::Ok().json(json!({"syndicate-to": []}))),
        Some("source") => {
            let Some(url) = get("url") else {
                return Ok(json_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    "Missing url",
                ));
            };
            let Some(uuid) = uuid_from_url(url) else {
                return Ok(json_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    "Malformed url",
                ));
            };

            let Some(entry) = store::get_entry(&pool, &uuid).await.map_err(error_500)? else {
                return Ok(HttpResponse::NotFound().finish());
            };

            let requested: Vec<&str> = params
                .iter()
                .filter(|(key, _)| key == "properties[]" || key == "properties")
                .map(|(_, value)| value.as_str())
                .collect();

            if requested.is_empty() {
                return Ok(HttpResponse::Ok().json(entry.content));
            }

            let properties: Map<String, Value> = entry
                .content
                .properties
                .into_iter()
                .filter(|(key, _)| requested.contains(&key.as_str()))
                .collect();
            Ok(HttpResponse::Ok().json(json!({"properties": properties})))
        }
        Some(other) => Ok(json_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            &format!("Unknown query: {other}"),
        )),
        None => Ok(json_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "Missing query",
        )),
    }
}

fn uuid_from_url(url: &str) -> Option<Uuid> {
    let path = url.split(['?', '#']).next()?;
    let segment = path.trim_end_matches('/').rsplit('/').next()?;
    Uuid::parse_str(segment).ok()
}

async fn read_body(mut payload: web::Payload) -> Result<web::BytesMut, actix_web::Error> {
    let mut body = web::BytesMut::new();
    while let Some(chunk) = payload.next().await {
        body.extend_from_slice(&chunk?);
    }
    Ok(body)
}

/// Dispatcher for creating, updating, deleting, and undeleting entries.
pub async fn micropub_post(
    req: HttpRequest,
    payload: web::Payload,
    grant: AccessGrant,
    pool: Data<SqlitePool>,
    settings: Data<Settings>,
    bus: Data<EventBus>,
) -> Result<HttpResponse, actix_web::Error> {
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    if content_type.starts_with("application/json") {
        let body = read_body(payload).await?;
        let value: Value = match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(e) => {
                return Ok(json_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    &e.to_string(),
                ));
            }
        };

        if let Some(action) = value.get("action").and_then(Value::as_str) {
            return dispatch_action(action, &value, &grant, &pool, &settings, &bus).await;
        }

        if let Some(type_) = value.get("type") {
            if type_ != &json!(["h-entry"]) {
                return Ok(HttpResponse::UnprocessableEntity().body("Only h-entry is supported"));
            }
        }

        let mut hentry = new_hentry(&settings);
        if let Some(Value::Object(properties)) = value.get("properties") {
            for (key, value) in properties {
                hentry.properties.insert(key.clone(), value.clone());
            }
        }

        return create(hentry, &grant, &pool, &bus).await;
    }

    if content_type.starts_with("multipart/form-data") {
        let (params, files) = read_multipart(req.headers(), payload, &settings).await?;

        if let Some((_, action)) = params.iter().find(|(key, _)| key == "action") {
            let value = form_to_value(&params);
            return dispatch_action(&action.clone(), &value, &grant, &pool, &settings, &bus)
                .await;
        }

        let mut hentry = match hentry_from_form(&params, &settings) {
            Ok(hentry) => hentry,
            Err(response) => return Ok(response),
        };
        for (name, url) in files {
            hentry.set_property(&name, json!(url));
        }

        return create(hentry, &grant, &pool, &bus).await;
    }

    // application/x-www-form-urlencoded
    let body = read_body(payload).await?;
    let params: Vec<(String, String)> = serde_urlencoded::from_bytes(&body)
        .map_err(actix_web::error::ErrorBadRequest)?;

    if let Some((_, action)) = params.iter().find(|(key, _)| key == "action") {
        let value = form_to_value(&params);
        return dispatch_action(&action.clone(), &value, &grant, &pool, &settings, &bus).await;
    }

    let hentry = match hentry_from_form(&params, &settings) {
        Ok(hentry) => hentry,
        Err(response) => return Ok(response),
    };

    create(hentry, &grant, &pool, &bus).await
}

/// Collect text fields and store file parts under fresh media ids.
async fn read_multipart(
    headers: &actix_web::http::header::HeaderMap,
    payload: web::Payload,
    settings: &Settings,
) -> Result<(Vec<(String, String)>, Vec<(String, String)>), actix_web::Error> {
    let mut multipart = Multipart::new(headers, payload);
    let mut params = Vec::new();
    let mut files = Vec::new();

    while let Some(field) = multipart.next().await {
        let mut field = field?;
        let Some(name) = field.content_disposition().get_name().map(String::from) else {
            continue;
        };
        let is_file = field.content_disposition().get_filename().is_some();

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            bytes.extend_from_slice(&chunk?);
        }

        if is_file {
            let uuid = Uuid::new_v4();
            let path = settings.media.path.join(uuid.to_string());
            tokio::fs::write(&path, &bytes).await.map_err(error_500)?;
            files.push((name, settings.media_url(&uuid.to_string())));
        } else {
            let text = String::from_utf8(bytes).map_err(actix_web::error::ErrorBadRequest)?;
            params.push((name, text));
        }
    }

    Ok((params, files))
}

/// Convert form data to Microformats 2 JSON: `h` gives the type, keys
/// ending in `[]` are multi-valued.
fn hentry_from_form(
    params: &[(String, String)],
    settings: &Settings,
) -> Result<Microformats2, HttpResponse> {
    if let Some((_, h)) = params.iter().find(|(key, _)| key == "h") {
        if h != "entry" {
            return Err(HttpResponse::UnprocessableEntity().body("Only h-entry is supported"));
        }
    }

    // repeated keys accumulate; a form value replaces the skeleton's own
    let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
    for (key, value) in params {
        if key == "h" {
            continue;
        }
        let key = key.strip_suffix("[]").unwrap_or(key);

        match grouped.iter_mut().find(|(k, _)| k == key) {
            Some((_, values)) => values.push(value.clone()),
            None => grouped.push((key.to_string(), vec![value.clone()])),
        }
    }

    let mut hentry = new_hentry(settings);
    for (key, values) in grouped {
        hentry.properties.insert(key, json!(values));
    }

    Ok(hentry)
}

fn form_to_value(params: &[(String, String)]) -> Value {
    let mut map = Map::new();
    for (key, value) in params {
        map.insert(key.clone(), json!(value));
    }
    Value::Object(map)
}

async fn create(
    hentry: Microformats2,
    grant: &AccessGrant,
    pool: &SqlitePool,
    bus: &EventBus,
) -> Result<HttpResponse, actix_web::Error> {
    grant.require("create")?;

    let location = hentry
        .property_str("url")
        .unwrap_or_default()
        .to_string();

    let entry = store::upsert_entry(pool, &hentry).await.map_err(error_500)?;
    bus.dispatch(Event::EntryCreated { new: entry });

    Ok(HttpResponse::Created()
        .insert_header((LOCATION, location))
        .finish())
}

async fn dispatch_action(
    action: &str,
    payload: &Value,
    grant: &AccessGrant,
    pool: &SqlitePool,
    settings: &Settings,
    bus: &EventBus,
) -> Result<HttpResponse, actix_web::Error> {
    if !["update", "delete", "undelete"].contains(&action) {
        return Ok(json_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            &format!("Invalid action: {action}"),
        ));
    }

    let Some(uuid) = payload
        .get("url")
        .and_then(Value::as_str)
        .and_then(uuid_from_url)
    else {
        return Ok(json_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "Missing or malformed url",
        ));
    };

    let Some(entry) = store::get_entry(pool, &uuid).await.map_err(error_500)? else {
        return Ok(HttpResponse::NotFound().finish());
    };

    match action {
        "update" => {
            grant.require("update")?;

            let old = entry.clone();
            let mut hentry = entry.content;

            hentry.set_property(
                "updated",
                json!(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
            );

            if let Some(Value::Object(replace)) = payload.get("replace") {
                for (key, value) in replace {
                    hentry.properties.insert(key.clone(), value.clone());
                }
            }

            if let Some(Value::Object(add)) = payload.get("add") {
                for (key, value) in add {
                    let Some(new_items) = value.as_array() else {
                        continue;
                    };
                    let existing = hentry
                        .properties
                        .entry(key.clone())
                        .or_insert_with(|| Value::Array(Vec::new()));
                    if let Value::Array(items) = existing {
                        items.extend(new_items.iter().cloned());
                    }
                }
            }

            if let Some(Value::Object(delete)) = payload.get("delete") {
                for (key, value) in delete {
                    let Some(to_remove) = value.as_array() else {
                        continue;
                    };
                    let mut now_empty = false;
                    if let Some(Value::Array(items)) = hentry.properties.get_mut(key) {
                        items.retain(|item| !to_remove.contains(item));
                        now_empty = items.is_empty();
                    }
                    // a property with no values left is dropped entirely
                    if now_empty {
                        hentry.properties.remove(key);
                    }
                }
            }

            let new = store::upsert_entry(pool, &hentry).await.map_err(error_500)?;
            bus.dispatch(Event::EntryUpdated { new, old });

            Ok(HttpResponse::NoContent()
                .insert_header((LOCATION, settings.entry_url(&uuid)))
                .finish())
        }
        "delete" => {
            grant.require("delete")?;

            store::delete_entry(pool, &entry).await.map_err(error_500)?;
            bus.dispatch(Event::EntryDeleted { old: entry });

            Ok(HttpResponse::NoContent().finish())
        }
        _ => {
            grant.require("undelete")?;

            store::undelete_entry(pool, &entry).await.map_err(error_500)?;
            // an undeleted entry re-enters the web like a new one
            bus.dispatch(Event::EntryCreated { new: entry });

            Ok(HttpResponse::NoContent().finish())
        }
    }
}
