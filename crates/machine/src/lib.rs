//! Core library of the machine controller.
//!
//! A `Machine` object declares a desired cluster node; this library watches
//! those objects and drives a cloud provider to make them real: provision
//! the backing instance with bootstrap credentials baked into its boot
//! configuration, adopt the node once it joins, keep the node's metadata in
//! sync, and tear the instance down again when the machine is deleted.
//!
//! The concrete cloud drivers and per-OS userdata generators live outside
//! this crate behind the [`provider::CloudProvider`] and
//! [`userdata::UserdataPlugin`] traits.

pub mod bootstrap;
pub mod config;
pub mod controller;
pub mod machine;
pub mod metrics;
pub mod migrations;
pub mod node;
pub mod provider;
pub mod queue;
pub mod store;
pub mod userdata;

pub use config::Config;
pub use controller::MachineController;
