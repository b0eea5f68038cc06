use actix_web::web::Data;
use actix_web::HttpResponse;

use crate::configuration::Settings;
use crate::feed::owner_hcard;

/// The site's identity: the owner h-card. This URL doubles as the owner's
/// `me` for IndieAuth.
pub async fn homepage(settings: Data<Settings>) -> HttpResponse {
    HttpResponse::Ok().json(owner_hcard(&settings))
}
