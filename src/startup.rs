use std::net::TcpListener;
use std::sync::Arc;

use actix_web::dev::Server;
use actix_web::dev::Service;
use actix_web::http::header::HeaderValue;
use actix_web::http::header::LINK;
use actix_web::web;
use actix_web::web::Data;
use actix_web::App;
use actix_web::HttpServer;
use sqlx::SqlitePool;
use tracing_actix_web::TracingLogger;

use crate::configuration::Settings;
use crate::events::EventBus;
use crate::http_client::federation_client;
use crate::routes::authorization;
use crate::routes::category;
use crate::routes::feed_entry;
use crate::routes::feed_index;
use crate::routes::health_check;
use crate::routes::homepage;
use crate::routes::introspect;
use crate::routes::media_download;
use crate::routes::media_upload;
use crate::routes::micropub_post;
use crate::routes::micropub_query;
use crate::routes::oauth_authorization_server;
use crate::routes::profile_exchange;
use crate::routes::revoke;
use crate::routes::search;
use crate::routes::token;
use crate::routes::userinfo;
use crate::routes::webmention_receive;
use crate::routes::webmention_status;
use crate::routes::websub_hub;
use crate::routes::websub_publish;
use crate::store::get_connection_pool;
use crate::urls::RouteTable;
use crate::webmention::WebmentionSender;
use crate::websub::WebsubNotifier;

/// Wrapper for actix's `Server` with access to the bound port.
pub struct Application {
    port: u16,
    server: Server,
}

impl Application {
    pub async fn build(cfg: Settings) -> Result<Self, anyhow::Error> {
        let addr = format!("{}:{}", cfg.application.host, cfg.application.port);
        let listener = TcpListener::bind(addr)?;
        let port = listener.local_addr()?.port();

        std::fs::create_dir_all(&cfg.media.path)?;

        let pool = get_connection_pool(&cfg.database);
        sqlx::migrate!().run(&pool).await?;

        let server = run(listener, pool, cfg)?;

        Ok(Self { port, server })
    }

    pub fn get_port(&self) -> u16 { self.port }

    /// Because this consumes `self`, this should be the final call (or be
    /// passed to `tokio::spawn`).
    pub async fn run_until_stopped(self) -> Result<(), std::io::Error> { self.server.await }
}

/// The `Link` headers every response advertises, per the IndieWeb
/// discovery conventions.
fn advertised_links(settings: &Settings) -> Vec<HeaderValue> {
    [
        (settings.micropub_url(), "micropub"),
        (settings.metadata_url(), "indieauth-metadata"),
        (settings.authorization_url(), "authorization_endpoint"),
        (settings.token_url(), "token_endpoint"),
        (settings.hub_url(), "hub"),
    ]
    .into_iter()
    .filter_map(|(url, rel)| HeaderValue::from_str(&format!(r#"<{url}>; rel="{rel}""#)).ok())
    .collect()
}

/// Declares all API endpoints and shared state; the server only listens on
/// an already-bound address.
pub fn run(listener: TcpListener, pool: SqlitePool, cfg: Settings) -> Result<Server, anyhow::Error> {
    let http = federation_client();

    let mut bus = EventBus::new();
    bus.register(WebmentionSender {
        pool: pool.clone(),
        http: http.clone(),
        settings: cfg.clone(),
    });
    bus.register(WebsubNotifier {
        pool: pool.clone(),
        http: http.clone(),
        settings: cfg.clone(),
    });
    let bus = Data::new(bus);

    let pool = Data::new(pool);
    let http = Data::new(http);
    let routes = Data::new(Arc::new(RouteTable::new()));
    let links = advertised_links(&cfg);
    let settings = Data::new(cfg);

    let server = HttpServer::new(move || {
        let links = links.clone();

        App::new()
            .wrap(TracingLogger::default())
            .wrap_fn(move |req, srv| {
                let links = links.clone();
                let fut = srv.call(req);
                async move {
                    let mut res = fut.await?;
                    for link in links {
                        res.headers_mut().append(LINK, link);
                    }
                    // no AI crawling, please
                    res.headers_mut().append(
                        actix_web::http::header::HeaderName::from_static("x-robots-tag"),
                        HeaderValue::from_static("noai"),
                    );
                    res.headers_mut().append(
                        actix_web::http::header::HeaderName::from_static("x-robots-tag"),
                        HeaderValue::from_static("noimageai"),
                    );
                    Ok(res)
                }
            })
            .route("/", web::get().to(homepage))
            .route("/health_check", web::get().to(health_check))
            .route("/feed", web::get().to(feed_index))
            .route("/feed/{uuid}", web::get().to(feed_entry))
            .route("/search", web::get().to(search))
            .route("/category/{category}", web::get().to(category))
            .route("/webmention", web::post().to(webmention_receive))
            .route("/webmention/{uuid}", web::get().to(webmention_status))
            .route("/websub", web::post().to(websub_hub))
            .route("/websub/publish", web::post().to(websub_publish))
            .route("/micropub", web::get().to(micropub_query))
            .route("/micropub", web::post().to(micropub_post))
            .route("/media", web::post().to(media_upload))
            .route("/media/{filename}", web::get().to(media_download))
            .route("/auth", web::get().to(authorization))
            .route("/auth", web::post().to(profile_exchange))
            .route("/token", web::post().to(token))
            .route("/introspect", web::post().to(introspect))
            .route("/revoke", web::post().to(revoke))
            .route("/userinfo", web::get().to(userinfo))
            .route(
                "/.well-known/oauth-authorization-server",
                web::get().to(oauth_authorization_server),
            )
            .app_data(pool.clone())
            .app_data(http.clone())
            .app_data(bus.clone())
            .app_data(routes.clone())
            .app_data(settings.clone())
    })
    .listen(listener)?
    .run();

    Ok(server)
}
