//! Gatehouse - supervisor and reverse proxy for a loopback gateway process
//!
//! This library provides a wrapper that sits in front of a single gateway:
//! - Starts the gateway on first demand, with single-flight start semantics
//! - Waits for the gateway's health endpoint before letting traffic through
//! - Strips forwarding/trust headers so the gateway sees a local peer
//! - Redirects browser navigations to the tokenized UI entry point
//! - Forwards HTTP requests through a pooled loopback client
//! - Bridges WebSocket connections frame by frame with keep-alive and
//!   coordinated teardown

pub mod config;
pub mod error;
pub mod gate;
pub mod headers;
pub mod net;
pub mod pool;
pub mod proxy;
pub mod readiness;
pub mod setup;
pub mod supervisor;
pub mod token;
pub mod ws;
