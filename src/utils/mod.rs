/// Shared helpers: external commands, polling and host probing
pub mod command;
pub mod polling;
pub mod probe;
