pub mod catalog;
pub mod color;
pub mod commands;
pub mod config;
pub mod devices;
pub mod docs;
pub mod effects;
pub mod error;
pub mod events;
pub mod handlers;
pub mod manager;
pub mod metrics;
pub mod models;
pub mod transport;
pub mod utils;
