mod command;
mod config;
mod docker;
mod runner;

pub use command::{CommandError, Privilege};
pub use config::{DEFAULT_IMAGE, DockerConfig};
pub use docker::DockerRuntime;
pub use runner::run_with_timeout;
