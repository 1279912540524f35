//! Coordination service core: a hierarchical, lease-based, session-
//! aware coordination kernel (spec §1, "OVERVIEW").

pub mod cache;
pub mod cancel;
pub mod config;
pub mod coordinator;
pub mod entry;
pub mod error;
pub mod lock_manager;
pub mod ops;
pub mod path;
pub mod session_id;
pub mod session_manager;
pub mod store;
pub mod stored_session;
pub mod wait_manager;
