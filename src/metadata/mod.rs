//! Node-local metadata: which tenants want which agent version, and which
//! volumes currently mount it.

pub mod models;
pub mod sqlite;
pub mod store;

pub use models::{tenant_id_from_api_url, Tenant, Volume};
pub use sqlite::SqliteStore;
pub use store::MetadataStore;
