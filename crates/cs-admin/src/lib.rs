//! cs-admin: Admin console library for ConSys
//!
//! Logs in to the server with password credentials over the reconnect
//! automaton and exposes the admin control service as a typed
//! [`AdminClient`]. The `consys-admin` binary is a thin shell around it.

pub mod client;
pub mod commands;
pub mod login;
pub mod output;

pub use client::{AdminClient, AdminNotification};
pub use login::Login;
