//! Stateful controllers: the JIT access grant lifecycle and the background
//! loops that sweep expired grants and scan for drift.

pub mod drift;
pub mod expiry;
pub mod jit;

pub use drift::DriftController;
pub use expiry::ExpirySweeper;
pub use jit::{GrantRequest, JitController, SweepStats};
