//! extracts-core
//!
//! Orchestration core for ordering registry extracts through a portal that interrupts
//! automation with human verification steps.
//!
//! - **domain**: jobs, orders, codes, schedule records, errors
//! - **ports**: contracts to the repository, the portal and the clock
//! - **queue**: work queue with retry and backoff
//! - **broker**: code delivery handshake and its inbound endpoint
//! - **schedule**: time-windowed single-flight gate
//! - **auth**: login state machine
//! - **app**: processors, sweep, worker wiring
//! - **impls**: in-memory adapters and a simulated portal

pub mod app;
pub mod artifact;
pub mod auth;
pub mod broker;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod schedule;
