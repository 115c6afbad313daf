//! Custom Resource Definitions for the attach operator
//!
//! - AttachmentRequest: desired attachment of one volume to one node, and
//!   the observed state of that attachment

pub mod attachment_request;

pub use attachment_request::*;
