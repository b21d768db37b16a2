// Database module for Where's My Dog
// Provides SQLite persistence for identity records

pub mod manager;
pub mod migrations;
pub mod models;
pub mod dogs_repo;

pub use manager::DatabaseManager;
pub use models::*;
