//! sqlpulse — a per-host MySQL observability agent.
//!
//! The agent keeps a duplex session with a remote control plane and runs
//! a registry of named services on top of a shared tick clock:
//!
//! - [`agent`] — the supervisor: command routing, crash respawn,
//!   reconnection, cooperative shutdown
//! - [`qan`] — query analytics: interval iterators, a bounded worker
//!   pool, slow-log rotation, spooled reports
//! - [`mm`] / [`sysconfig`] — tick-driven metric and configuration
//!   collectors
//! - [`log`] — the buffering, reconnection-aware log relay
//! - [`mrm`] — upstream restart detection feeding QAN
//! - [`ticker`] — the aligned tick clock all of the above subscribe to
//!
//! External collaborators (websocket transport, database driver, HTTP
//! API) are consumed through traits in [`transport`], [`mysql`], and
//! [`agent`]; everything is wired together explicitly at `main`, never
//! through globals.

pub mod agent;
pub mod backoff;
pub mod basedir;
pub mod error;
pub mod instance;
pub mod log;
pub mod mm;
pub mod mrm;
pub mod mysql;
pub mod proto;
pub mod qan;
pub mod service;
pub mod spool;
pub mod status;
pub mod syncchan;
pub mod sysconfig;
pub mod ticker;
pub mod transport;

use std::future::Future;
use std::pin::Pin;

/// Boxed future used by the object-safe capability traits
/// ([`service::ServiceManager`], [`mysql::Connector`],
/// [`transport::Client`], ...).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Version of the sqlpulse library and agent binary.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
