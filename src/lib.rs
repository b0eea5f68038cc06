pub mod authentication;
pub mod configuration;
pub mod domain;
pub mod events;
pub mod feed;
pub mod http_client;
pub mod indieauth;
pub mod mf2;
pub mod routes;
pub mod startup;
pub mod store;
pub mod telemetry;
pub mod urls;
pub mod utils;
pub mod webmention;
pub mod websub;
