//! notify-hub: real-time notification routing for bakery operations
//! dashboards.
//!
//! Inbound events from the real-time transport are normalized, deduplicated,
//! filtered by the viewer's role and scope, and kept in a bounded
//! newest-first collection whose unread counts feed per-route badges.

pub mod config;
pub mod error;
pub mod logging;
pub mod notification;
pub mod store;
pub mod transport;

pub use error::{Error, Result};
