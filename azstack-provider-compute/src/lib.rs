//! Azure Stack Compute provider for azstack
//!
//! Manages availability sets, managed disks, images, Linux and Windows
//! virtual machines, virtual machine extensions, Linux scale sets and scale
//! set extensions through the ARM API of an Azure Stack Hub stamp.
//!
//! ## Module Structure
//!
//! - `client` - ARM REST client, token acquisition and LRO polling
//! - `config` - Provider block and feature switches
//! - `models` - ARM wire payloads
//! - `parse` - Typed Compute resource IDs
//! - `provider` - AzureStackProvider implementation
//! - `resources` - Schema and lifecycle of each resource type
//! - `utils` - Attribute accessors shared by the resource modules

pub mod client;
pub mod config;
pub mod models;
pub mod parse;
pub mod provider;
pub mod resources;
pub mod utils;

// Re-export main types
pub use client::{ArmClient, ArmError, Credentials, PollConfig};
pub use config::{Features, ProviderConfig};
pub use provider::AzureStackProvider;
