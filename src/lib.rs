pub mod ansi_html;
pub mod backend;
pub mod color;
pub mod commands;
pub mod config;
pub mod events;
pub mod matrix;
pub mod output;
pub mod pending;
pub mod protocol;
pub mod relay;
pub mod room_cache;
pub mod sgr;
pub mod transport;
pub mod trust;
