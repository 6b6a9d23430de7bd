//! RateKeeper Library
//!
//! Multi-window admission control with persistent usage tracking. The
//! limiter decides, the store remembers, and the admin/analytics surfaces
//! operate on the same shared state.

pub mod admin;
pub mod analytics;
pub mod clock;
pub mod config;
pub mod limiter;
pub mod maintenance;
pub mod metrics;
pub mod metrics_server;
pub mod server;
pub mod store;
