//! Shared utilities for the Cloudmeter ledger binaries and libraries.

pub mod distributed;
pub mod logging;
