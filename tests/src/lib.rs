//! # Lantern Test Suite
//!
//! Unified test crate containing cross-subsystem scenarios:
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── fixtures.rs           # Shared chain/session builders
//!     ├── chain_scenarios.rs    # Header + filter store flows
//!     └── session_scenarios.rs  # Peer sessions over real stores
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p ln-tests
//! cargo test -p ln-tests integration::
//! ```

#![allow(unused_imports)]
#![allow(dead_code)]

pub mod integration;
