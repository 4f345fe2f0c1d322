//! # Trellis
//!
//! An HTTPS edge router: terminates TLS for many hostnames, matches requests
//! against a dynamically discovered catalog of applications, and dispatches
//! each one to a per-application backend handler.
//!
//! ## Architecture
//!
//! ```text
//! Listener → hostname/path resolve → (HTTPS redirect, IP ACL, strip prefix) → Backend
//!                     ▲
//!       discovery poll → routing table build → atomic snapshot swap
//! ```
//!
//! ## Core pieces
//!
//! - **Routing**: exact-hostname, hostname-pattern and global path-prefix
//!   mounts with longest-prefix precedence ([`routing`])
//! - **Config plane**: polled discovery sources, immutable routing-table
//!   snapshots, fingerprint-keyed backend handler reuse ([`discovery`],
//!   [`backend`], [`server::AtomicConfig`])
//! - **Backends**: reverse proxy (optional disk response cache), redirect,
//!   bearer-token auth wrapper, CAS static sites, admin UI, metrics
//!   ([`backend`])
//! - **Turbocharger**: two-tier content-addressed cache with single-flight
//!   origin fetches, pre-compression and lazy subtree discovery
//!   ([`turbocharger`])

pub mod backend;
pub mod config;
pub mod discovery;
pub mod error;
pub mod routing;
pub mod server;
pub(crate) mod sync;
pub mod turbocharger;

// Re-export main types
pub use config::{Application, Backend, Frontend};
pub use error::{EdgeError, Result};
pub use server::{serve, ServeOptions};
