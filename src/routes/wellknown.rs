use actix_web::web::Data;
use actix_web::HttpResponse;
use serde_json::json;

use crate::configuration::Settings;
use crate::indieauth;

/// IndieAuth server metadata.
///
/// https://indieauth.spec.indieweb.org/#indieauth-server-metadata
pub async fn oauth_authorization_server(settings: Data<Settings>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "issuer": settings.metadata_url(),
        "authorization_endpoint": settings.authorization_url(),
        "token_endpoint": settings.token_url(),
        "introspection_endpoint": settings.introspection_url(),
        "introspection_endpoint_auth_methods_supported": ["client_secret_basic"],
        "revocation_endpoint": settings.revocation_url(),
        "revocation_endpoint_auth_methods_supported": ["none"],
        "scopes_supported": indieauth::SCOPES_SUPPORTED,
        "response_types_supported": indieauth::RESPONSE_TYPES_SUPPORTED,
        "grant_types_supported": indieauth::GRANT_TYPES_SUPPORTED,
        "service_documentation": "https://indieauth.spec.indieweb.org/",
        "code_challenge_methods_supported": indieauth::CODE_CHALLENGE_METHODS_SUPPORTED,
        "authorization_response_iss_parameter_supported": true,
        "userinfo_endpoint": settings.userinfo_url(),
    }))
}
