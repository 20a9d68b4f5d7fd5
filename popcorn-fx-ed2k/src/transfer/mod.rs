pub use connection::*;
pub use errors::*;
pub use ip_filter::*;
pub use md4_hash::*;
pub use peer::*;
pub use peer_registry::*;
pub use piece_tracker::*;
pub use policy::*;
pub use session::*;
pub use session_config::*;
pub use session_context::*;
pub use storage::*;
pub use transfer::*;

mod connection;
mod errors;
mod ip_filter;
mod md4_hash;
mod peer;
mod peer_registry;
mod piece_tracker;
mod policy;
mod session;
mod session_config;
pub(crate) mod session_context;
mod storage;
mod transfer;
