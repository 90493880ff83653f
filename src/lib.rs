// Ambient infrastructure
pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

// Background core
pub mod error_sink;
pub mod mail;
pub mod shutdown;
pub mod tasks;

// Domain collaborators
pub mod documents;
pub mod membership;
pub mod template;

// Application layer
pub mod api;
pub mod server;
