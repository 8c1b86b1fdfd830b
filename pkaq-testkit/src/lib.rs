//! Test doubles and fixtures shared by the pkaq test suites.

mod cluster;
mod fixtures;
mod mock;
mod queue;
mod routine;

pub use cluster::*;
pub use fixtures::*;
pub use mock::*;
pub use queue::*;
pub use routine::*;
