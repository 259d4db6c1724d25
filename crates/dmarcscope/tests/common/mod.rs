//! Shared test utilities for dmarcscope integration tests.
//!
//! - `TestHarness`: temp directory plus a file-backed database
//! - builders for report XML, gzip/zip containers and report mails

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
