//! Helpers shared by integration test binaries.

#![allow(dead_code)]

pub mod fake_transport;
pub mod socket_guard;
