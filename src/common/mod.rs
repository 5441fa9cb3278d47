//! # Common Components
//!
//! Shared utilities and data structures used by the clients, the runner and
//! the binary.
//!
//! ## Modules
//!
//! - [`config`]: TOML configuration structures and loading
//! - [`constants`]: Environment variable names and API endpoints
//! - [`error`]: The typed library error
//! - [`stage_flow`]: Computation stages and instance lifecycle status

pub mod config;
pub mod constants;
pub mod error;
pub mod stage_flow;
