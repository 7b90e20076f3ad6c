pub mod commands;
pub mod manifest;
pub mod types;
