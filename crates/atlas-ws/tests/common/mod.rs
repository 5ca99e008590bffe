//! Shared fixtures for atlas-ws integration tests.

pub mod mock_ws;
