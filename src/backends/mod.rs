//! Attachment Backends
//!
//! Implementations of [`crate::domain::ports::AttachmentProvisioner`].

pub mod rest;

pub use rest::{RestAttachmentProvisioner, RestProvisionerConfig};
