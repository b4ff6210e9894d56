//! Configuration loading and application.
mod apply;
mod loader;
pub mod types;


pub use apply::{ParkingSettings, ServeSettings, apply_config};
pub use loader::load_config;
