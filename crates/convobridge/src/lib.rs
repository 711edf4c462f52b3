//! Convobridge keeps a chat transport and a helpdesk console in sync.
//!
//! The reliability core detects transport outages per tenant, tells the
//! console about them, and drives bounded pairing attempts to recover. Every
//! side-effecting forward passes through an idempotency gate so upstream
//! redeliveries are harmless.

pub mod bridge;
pub mod build_info;
pub mod cache;
pub mod config;
pub mod console;
pub mod forward;
pub mod gate;
pub mod handlers;
pub mod notify;
pub mod operator;
pub mod reliability;
pub mod server;
pub mod sync;
pub mod tenant;
pub mod transport;

pub use bridge::Bridge;
