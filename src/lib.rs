//! Face detection job pipeline
//!
//! Uploaded images become jobs persisted in PostgreSQL and referenced from a
//! Redis stream. A pool of workers in one consumer group detects faces,
//! stores annotated images and publishes completion events that live
//! WebSocket listeners forward to clients.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod shutdown;
