pub mod batch;
pub mod error;
pub mod events;
pub mod models;
pub mod ops;
pub mod parts;
pub mod prefs;
