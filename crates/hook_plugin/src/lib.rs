pub mod jsonrpc;
pub mod message;
pub mod plugin_actor;
pub mod plugin_runtime;
