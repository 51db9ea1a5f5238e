//! Shared helpers for the provisioner binaries: logging bootstrap and build version.

mod build_info;
pub mod logging;
pub mod version;
