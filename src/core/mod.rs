pub mod api;
pub mod config;
pub mod error;
pub mod estimator;
pub mod events;
pub mod live_channel;
pub mod models;
pub mod notifier;
pub mod polling;
pub mod sse;
pub mod tracker;
