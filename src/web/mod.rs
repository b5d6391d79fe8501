//! The web module for handling the Axum API.

pub mod api;
