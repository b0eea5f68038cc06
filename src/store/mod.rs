use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::configuration::DatabaseSettings;

mod entries;

pub use entries::delete_entry;
pub use entries::get_entries;
pub use entries::get_entry;
pub use entries::get_entry_with_children;
pub use entries::list_by_category;
pub use entries::search_entries;
pub use entries::undelete_entry;
pub use entries::upsert_entry;

pub fn get_connection_pool(db_cfg: &DatabaseSettings) -> SqlitePool {
    SqlitePoolOptions::new().connect_lazy_with(db_cfg.connection())
}
