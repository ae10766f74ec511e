//! Core types for the NodeLink peer-to-peer communication layer.
//!
//! This crate defines the identifiers, reachability records, protocol
//! descriptions and configuration shared by the wire crate and the CLI. It
//! contains no business logic.

pub mod config;
pub mod description;
pub mod endpoint;
pub mod id;

pub use description::{CommunicationSubject, ProtocolDescription};
pub use endpoint::{ChannelTemplate, EndpointInformation, ProtocolInformation, Version};
pub use id::{EndpointId, MessageId, UploadToken};
