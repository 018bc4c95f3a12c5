//! Daemon support shared by the server binary

pub mod signals;

pub use signals::{install_shutdown_handlers, shutdown_requested};
