//! The proxy engine: listener, per-connection handling, the configuration
//! API and upstream connections

mod api;
mod handler;
pub mod response;
mod server;
mod tunnel;
mod upstream;

pub use api::Api;
pub use handler::ProxyHandler;
pub use server::{ProxyServer, SHUTDOWN_GRACE};
pub use upstream::UpstreamClient;
