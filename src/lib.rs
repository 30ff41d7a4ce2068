pub mod app;
pub mod config;
pub mod config_io;
pub mod download;
pub mod logging;
pub mod net;
pub mod single_instance;
