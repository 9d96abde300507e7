//! Resource transfer for pycell sandboxes
//!
//! Two halves of one HTTP protocol:
//!
//! - [`server`]: the axum service that runs inside the sandbox container and
//!   exposes file/archive transfer, Python module source retrieval, and
//!   tool-client generation over the resource port.
//! - [`ResourceClient`]: the host-side typed client for those endpoints.
//!
//! Directory transfers use classic ustar tar framing. Symlinks are followed
//! when archiving and rejected as entries when extracting, so archives
//! cannot escape the server root.

mod archive;
mod client;
mod error;
mod modules;
pub mod server;

pub use archive::{pack_dir, unpack_archive, ArchiveError};
pub use client::{ConnectOptions, ResourceClient};
pub use error::{ResourceError, Result};
