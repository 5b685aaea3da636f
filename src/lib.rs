pub mod background;
pub mod cli;
pub mod client;
pub mod config;
pub mod control;
pub mod daemon;
pub mod log;
pub mod paths;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod service;
pub mod watch;
