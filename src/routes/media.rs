use actix_web::http::header::LOCATION;
use actix_web::http::StatusCode;
use actix_web::web;
use actix_web::web::Data;
use actix_web::HttpRequest;
use actix_web::HttpResponse;
use futures_util::StreamExt;
use uuid::Uuid;

use crate::authentication::AccessGrant;
use crate::configuration::Settings;
use crate::utils::error_500;
use crate::utils::json_error;

/// Upload a file to the media endpoint. The part must be named `file`; the
/// stored id is a fresh 128-bit uuid.
///
/// https://micropub.spec.indieweb.org/#media-endpoint
pub async fn media_upload(
    req: HttpRequest,
    payload: web::Payload,
    grant: AccessGrant,
    settings: Data<Settings>,
) -> Result<HttpResponse, actix_web::Error> {
    grant.require("media")?;

    let mut multipart = actix_multipart::Multipart::new(req.headers(), payload);

    while let Some(field) = multipart.next().await {
        let mut field = field?;
        if field.content_disposition().get_name() != Some("file") {
            continue;
        }

        let uuid = Uuid::new_v4();
        let path = settings.media.path.join(uuid.to_string());

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        tokio::fs::write(&path, &bytes).await.map_err(error_500)?;

        return Ok(HttpResponse::Created()
            .insert_header((LOCATION, settings.media_url(&uuid.to_string())))
            .finish());
    }

    Ok(json_error(
        StatusCode::BAD_REQUEST,
        "invalid_request",
        "Part name `file` not found in multipart/form-data request.",
    ))
}

/// Serve a file from the media endpoint. The content type is sniffed from
/// the first bytes, since stored files carry no extension.
pub async fn media_download(
    path: web::Path<String>,
    settings: Data<Settings>,
) -> Result<HttpResponse, actix_web::Error> {
    let filename = path.into_inner();

    // stored ids are uuids; anything else is a traversal attempt
    if Uuid::parse_str(&filename).is_err() {
        return Ok(HttpResponse::NotFound().finish());
    }

    let file_path = settings.media.path.join(&filename);
    let bytes = match tokio::fs::read(&file_path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(HttpResponse::NotFound().finish());
        }
        Err(e) => return Err(error_500(e)),
    };

    let content_type = sniff_content_type(&bytes);

    Ok(HttpResponse::Ok().content_type(content_type).body(bytes))
}

fn sniff_content_type(bytes: &[u8]) -> &'static str {
    match bytes {
        [0xff, 0xd8, 0xff, ..] => "image/jpeg",
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        [b'<', ..] => "text/html; charset=utf-8",
        _ => "application/octet-stream",
    }
}
