//! Common test infrastructure
//!
//! This module provides the media server, collaborator fakes and fixtures
//! the integration tests share. Tests should only import from this module,
//! not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{MediaServer, Route, TestScanner, png_bytes, CLEAN_COLOR};
//!
//! #[tokio::test]
//! async fn test_scan_url() {
//!     let server = MediaServer::spawn().await;
//!     let url = server.route("/a.png", Route::png(png_bytes(CLEAN_COLOR)));
//!     let scanner = TestScanner::builder().build();
//!     let report = scanner.scan_url(&url).await;
//!     assert!(!report.flagged);
//! }
//! ```

#![allow(dead_code)]

mod constants;
mod fakes;
mod fixtures;
mod scanner;
mod server;

// Public API - this is what tests import
pub use constants::*;
pub use fakes::{FakeClassifier, FakeMessageSource, FakeSimilarityIndex, RecordedFlag, RecordingHandler};
pub use fixtures::*;
pub use scanner::{TestScanner, TestScannerBuilder};
pub use server::{MediaServer, Route};
