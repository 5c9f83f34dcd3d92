//! Webhook inspection and replay.
//!
//! Anonymous callers capture arbitrary inbound requests under their identity
//! token and later replay a captured request against a destination of their
//! choosing. Every replay that reaches the network is recorded, whether it got
//! a response or failed in transport.

pub mod api;
pub mod capture;
pub mod config;
pub mod db;
pub mod domain;
pub mod errors;
pub mod identity;
pub mod limiter;
pub mod replay;
