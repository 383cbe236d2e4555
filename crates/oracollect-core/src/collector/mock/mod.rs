//! Mock filesystem and fixtures for tests.

mod filesystem;
mod scenarios;

pub use filesystem::MockFs;
