mod categories;
mod feed;
mod health_check;
mod homepage;
mod indieauth;
mod media;
mod micropub;
mod search;
mod webmention;
mod websub;
mod wellknown;

pub use categories::category;
pub use feed::feed_entry;
pub use feed::feed_index;
pub use health_check::health_check;
pub use homepage::homepage;
pub use indieauth::authorization;
pub use indieauth::introspect;
pub use indieauth::profile_exchange;
pub use indieauth::revoke;
pub use indieauth::token;
pub use indieauth::userinfo;
pub use media::media_download;
pub use media::media_upload;
pub use micropub::micropub_post;
pub use micropub::micropub_query;
pub use search::search;
pub use webmention::webmention_receive;
pub use webmention::webmention_status;
pub use websub::websub_hub;
pub use websub::websub_publish;
pub use wellknown::oauth_authorization_server;
