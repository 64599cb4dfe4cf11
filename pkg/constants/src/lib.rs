//! Centralized constants for the kgate project.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod auth;
pub mod compliance;
pub mod jit;
pub mod paths;
pub mod state;
