pub mod api;
pub mod config;
pub mod event;
pub mod handler;
pub mod identity;
pub mod metrics_consts;
pub mod pipeline;
pub mod store;
pub mod time;
pub mod transport;

// Compiled in so the server crate and integration tests can share the doubles.
pub mod test_utils;
