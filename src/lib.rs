pub mod app;
pub mod automation;
pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod logger;
pub mod owner;
pub mod plugins;
pub mod router;
pub mod routing;
pub mod session;
