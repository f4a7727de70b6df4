pub mod config;
pub mod interval;
pub mod song;
