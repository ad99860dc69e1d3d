//! # REST API Module
//!
//! This module defines all HTTP endpoints of the Salad operator. The
//! same operations are available as WebSocket actions.
//!
//! ## Endpoint Overview
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/operator/config` | Contract addresses and public key bundle |
//! | GET | `/operator/threshold` | Participation threshold |
//! | GET | `/operator/quorum` | Number of fillable deposits |
//! | GET | `/operator/deposits` | Fillable deposits |
//! | POST | `/operator/deposits` | Submit signed deposit metadata |
//! | GET | `/operator/deals` | Deals by status |
//! | GET | `/health` | Health check |
//!
//! ## Request/Response Format
//!
//! All requests and responses use JSON. Amounts are decimal strings.
//!
//! ```json
//! // Success response
//! {
//!     "success": true,
//!     "data": { ... }
//! }
//!
//! // Error response
//! {
//!     "success": false,
//!     "error": {
//!         "code": "ERROR_CODE",
//!         "message": "Human readable message"
//!     }
//! }
//! ```

pub mod handlers;
pub mod routes;

pub use routes::configure_routes;
