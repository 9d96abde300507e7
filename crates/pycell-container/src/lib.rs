//! Container lifecycle control for pycell sandboxes
//!
//! Provisions sandbox containers with the Docker daemon via bollard: image
//! pull with surfaced progress, host port mapping, bind mounts, environment
//! injection, TCP liveness gating, teardown, and in-container egress
//! firewall installation.
//!
//! The daemon is located through platform defaults, or through the
//! `DOCKER_HOST` environment variable for remote daemons.

mod container;
mod error;
mod firewall;
mod probe;
mod pull;

pub use container::{connect_docker, SandboxContainer, StartOptions};
pub use error::{ContainerError, Result};
pub use probe::wait_tcp;
pub use pull::PullProgress;
