// SPDX-License-Identifier: MIT OR Apache-2.0
//! coral: a client-side dispatcher that runs registered functions on
//! remote compute backends.
//!
//! The workspace splits along the seams of a run: [`spec`] holds the
//! contract types, [`bundle`] produces content-addressed source archives,
//! [`backend`] defines the capability contracts a backend satisfies,
//! [`session`] orchestrates one submission from bundle to result, and
//! [`worker`] is the bootstrap that runs inside the container. This crate
//! re-exports the family plus the types most callers need.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub use coral_backend_core as backend;
pub use coral_bundle as bundle;
pub use coral_cache as cache;
pub use coral_config as config;
pub use coral_core as spec;
pub use coral_error as error;
pub use coral_protocol as protocol;
pub use coral_session as session;
pub use coral_worker as worker;

pub use coral_backend_mock::MockBackend;
pub use coral_core::{
    AppSpec, FunctionSpec, ImageSpec, LocalSource, ResourceSpec, SourceMode,
};
pub use coral_error::{CoralError, ErrorKind};
pub use coral_session::{App, FunctionHandle, RunSession, SessionOptions};
pub use coral_worker::Worker;
