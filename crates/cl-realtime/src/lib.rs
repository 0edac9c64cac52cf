//! # cl-realtime
//!
//! Real-time messaging core for Careline consultations: the connection
//! registry, broadcast router, presence notifications, and the per-socket
//! read/write pumps.
//!
//! The [`ChatHub`] is constructed once at server startup and handed to
//! collaborators by dependency injection; it is the only path by which
//! application code reaches a live socket. Delivery is best-effort to
//! currently-connected peers; durable history belongs to the persistence
//! layer, not here.

pub mod connection;
pub mod frame;
pub mod hub;
mod presence;
pub mod registry;
pub mod router;
pub mod supervisor;

pub use hub::ChatHub;
pub use registry::ClientKey;
