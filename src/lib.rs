pub mod api;
pub mod codec;
pub mod config;
pub mod driver;
pub mod logger;
pub mod manifest;
pub mod pipeline;
pub mod policy;
pub mod quota;
pub mod schema;
pub mod session;
pub mod watcher;
