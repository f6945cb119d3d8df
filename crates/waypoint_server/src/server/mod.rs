#![forbid(unsafe_code)]

pub mod auth;
pub mod bridge;
pub mod broker;
pub mod connection;
pub mod gateway;
pub mod health;
pub mod identity;
pub mod liveness;
pub mod registry;
pub mod session;

#[cfg(test)]
mod bridge_tests;
