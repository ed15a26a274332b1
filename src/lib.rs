pub mod announce;
pub mod bucket;
pub mod cache;
pub mod client;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod discover;
pub mod error;
pub mod identity;
pub mod inbox;
pub mod logging;
pub mod protocol;
pub mod schema;
pub mod session;
pub mod transport;
