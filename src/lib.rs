//! Tapline - A programmable HTTP/S interception proxy
//!
//! Every request and response passing through the proxy is run through a
//! tree of modifiers that can rewrite, verify, short-circuit or record it.
//!
//! # Features
//!
//! - **Modifier pipeline**: ordered groups, conditional filters and a JSON
//!   registry, swappable at runtime through the configuration API
//! - **HTTPS interception**: CONNECT tunnels are decrypted with leaf
//!   certificates issued per tunnel by a local authority
//! - **Transaction log**: every exchange is captured as a HAR entry and
//!   periodically appended to a JSONL file
//! - **Graceful shutdown**: in-flight requests finish before the process exits
//!
//! # Example
//!
//! ```no_run
//! use tapline::{Config, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     tapline::tls::install_crypto_provider();
//!     let config = Config::from_file("tapline.toml")?;
//!     let (_tx, rx) = tokio::sync::oneshot::channel();
//!     ProxyServer::new(config)?.run_until_shutdown(rx).await?;
//!     Ok(())
//! }
//! ```

#[cfg(test)]
#[macro_use]
pub(crate) mod test_support;

pub mod config;
pub mod error;
pub mod har;
pub mod modifier;
pub mod proxy;
pub(crate) mod shutdown;
pub mod tls;

pub use config::Config;
pub use error::{Error, Result};
pub use har::{Exporter, Recorder};
pub use modifier::{Modifier, ModifierError};
pub use proxy::ProxyServer;
