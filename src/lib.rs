pub mod airtable;
pub mod bridge;
pub mod computer;
pub mod error;
pub mod events;
pub mod rate_limiter;
pub mod registry;
pub mod relay;
pub mod runtime;
pub mod sandbox;
pub mod server;
pub mod session;
pub mod settings;
pub mod vectorstore;
