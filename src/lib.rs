//! Boardingpass — one-shot device provisioning daemon.
//!
//! A remote operator authenticates once over TLS with an SRP-6a
//! zero-knowledge password proof, inspects device identity and network
//! state, atomically writes a configuration bundle into allow-listed
//! locations, runs allow-listed privileged commands, and signals
//! completion. After completion the sentinel file keeps the service from
//! ever starting again until the device is reimaged.

pub mod apply;
pub mod auth;
pub mod commands;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod password;
pub mod server;
pub mod srp;
pub mod sysinfo;
