pub mod cache;
pub mod cli;
pub mod codec;
pub mod config;
pub mod database;
pub mod dbfile;
pub mod error;
pub mod http_server;
pub mod store;

pub use cache::HandleCache;
pub use codec::Codec;
pub use config::Config;
pub use database::Database;
pub use error::{Result, StoreError};
pub use store::Store;

use std::collections::BTreeMap;

/// Keys and values as they cross the API boundary. Ordered so responses
/// come back in the same key order the buckets store.
pub type Keystore = BTreeMap<String, String>;
