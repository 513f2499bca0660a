mod client;
mod commands;

pub use commands::Cli;
