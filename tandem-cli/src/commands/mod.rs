pub mod config;
pub mod control;
pub mod init;
pub mod start;
