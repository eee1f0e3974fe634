//! Flagbox - short-lived practice instances with a restricted shell.
//!
//! Each instance gets a random id, a flag derived from it, and a private
//! sandbox directory. Instances expire after a fixed TTL, either lazily on
//! the next lookup or via the background [`sweeper::Sweeper`].

pub mod config;
pub mod error;
pub mod executor;
pub mod http_server;
pub mod sandbox;
pub mod state;
pub mod sweeper;
pub mod validator;

pub use config::Config;
pub use error::{InstanceError, Rejection};
pub use executor::{ExecLimits, ExecOutput};
pub use state::{AppState, FlagCheck, Instance, InstanceStatus, InstanceStore};
pub use sweeper::Sweeper;
pub use validator::ValidatedCommand;
