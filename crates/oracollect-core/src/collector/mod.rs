//! Host-side collaborators: process discovery over `/proc`.
//!
//! Everything reads through the [`FileSystem`] trait so tests can swap the
//! real `/proc` for a [`MockFs`] fixture.

pub mod mock;
pub mod procfs;
pub mod traits;

pub use mock::MockFs;
pub use procfs::{ProcError, ProcessFinder};
pub use traits::{FileSystem, RealFs};
