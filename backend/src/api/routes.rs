//! # API Route Configuration
//!
//! This module sets up all the HTTP routes for the API.

use actix_web::web;

use super::handlers;

/// Configure all API routes.
///
/// This function is called from main.rs to set up
/// all the endpoint routes.
///
/// ## Route Structure
///
/// ```text
/// /
/// ├── /health              GET  - Health check
/// └── /operator
///     ├── /config          GET  - Contract addresses and public key bundle
///     ├── /threshold       GET  - Participation threshold
///     ├── /quorum          GET  - Number of fillable deposits
///     ├── /deposits        GET  - Fillable deposits
///     ├── /deposits        POST - Submit signed deposit metadata
///     └── /deals           GET  - Deals by status
/// ```
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg
        // Root endpoint - API information
        .route("/", web::get().to(handlers::api_info))

        // Health check endpoint
        .route("/health", web::get().to(handlers::health_check))

        // Operator endpoints
        .service(
            web::scope("/operator")
                .route("/config", web::get().to(handlers::get_config))
                .route("/threshold", web::get().to(handlers::get_threshold))
                .route("/quorum", web::get().to(handlers::get_quorum))
                .route("/deposits", web::get().to(handlers::get_fillable_deposits))
                .route("/deposits", web::post().to(handlers::submit_deposit))
                .route("/deals", web::get().to(handlers::get_deals)),
        );
}
