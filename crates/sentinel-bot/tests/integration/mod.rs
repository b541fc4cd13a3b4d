//! Shared fixtures for the engine integration tests.

pub mod common;
