pub mod config;
pub mod error;
pub mod fastboot;
pub mod flasher;
pub mod interrupt;
pub mod logging;
pub mod models;
pub mod requirements;
pub mod resources;
pub mod retry;
pub mod scheduler;
