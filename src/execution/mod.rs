//! Container execution layer.
//!
//! [`ExecutionDispatcher`] is the seam between the task driver and the
//! container runtime. [`DockerDispatcher`] implements it with bollard;
//! tests substitute an in-memory fake.
//!
//! # Example
//!
//! ```ignore
//! use iac_runner::execution::{DockerDispatcher, ExecutionDispatcher};
//!
//! let dispatcher = DockerDispatcher::connect()?;
//! let handle = dispatcher.start(&command).await?;
//! let exit_code = dispatcher.wait(&handle).await?;
//! ```

pub mod dispatcher;
pub mod docker_client;

pub use dispatcher::{ContainerHandle, DockerDispatcher, ExecutionDispatcher};
pub use docker_client::{ContainerSpec, ContainerStatusInfo, DockerClient};
