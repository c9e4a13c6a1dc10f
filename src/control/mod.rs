//! Control surface - Operator requests over a local Unix socket

pub mod routes;
pub mod server;

pub use routes::{router, ControlState};
