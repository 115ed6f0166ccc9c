//! Client for a fleet of sandbox servers.
//!
//! A [`Dispatcher`] owns the endpoint rotation and creates
//! [`RemoteSandbox`] handles; every handle reports back to the dispatcher
//! that created it, so an endpoint that fails provisioning leaves the
//! rotation for all of them.

mod config;
mod dispatch;
mod error;
mod http;
mod remote;

pub use config::{ClientConfig, ENDPOINTS_ENV, Policy, parse_endpoints};
pub use dispatch::Dispatcher;
pub use error::{ClientError, ClientResult};
pub use remote::{RemoteSandbox, UPLOAD_CHUNK, shell_escape};
