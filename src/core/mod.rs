//! Core module - Manifests, runtime state, process supervision and health

pub mod app;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod logs;
pub mod manifest;
pub mod monitor;
pub mod process;
pub mod settings;

pub use lifecycle::AppManager;
pub use manifest::Registry;
pub use settings::Settings;
