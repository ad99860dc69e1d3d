//! # API Models
//!
//! This module defines the request and response structures for the REST
//! API and the WebSocket actions. These are separate from database models
//! to allow API-specific formatting.
//!
//! ## Organization
//!
//! - `requests.rs` - Incoming request bodies and queries
//! - `responses.rs` - Outgoing response bodies
//!
//! ## Serialization
//!
//! All models use Serde for JSON serialization/deserialization.
//! Field names are converted to camelCase for JavaScript clients, and
//! amounts travel as decimal strings.

pub mod requests;
pub mod responses;

pub use requests::*;
pub use responses::*;
