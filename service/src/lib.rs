//! Compiler-service connections for tsmux.
//!
//! A [`ServiceInstance`] is one live connection to a compiler service scoped
//! to a project root. The [`ServiceResolver`] owns every instance, maps file
//! paths to the instance of their project, and reports what the instances
//! do through a single [`ServiceEvent`] channel.
//!
//! The wire protocol is hidden behind [`Connector`] / [`Connection`]; the
//! stock implementation is [`ProcessConnector`], which speaks tsserver-style
//! JSON over a child process's stdio.

pub mod codec;
pub mod config;
pub mod protocol;

mod connection;
mod error;
mod instance;
mod process;
mod resolver;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use config::ServiceConfig;
pub use connection::{Connection, Connector, PushSink, RpcFut, ServiceEvent, StopReason};
pub use error::ServiceError;
pub use instance::{PendingRegistry, PendingRequest, ServiceInstance};
pub use process::ProcessConnector;
pub use protocol::{CompletionEntry, Location, ProjectInfo};
pub use resolver::{ServiceResolver, discover_project};
