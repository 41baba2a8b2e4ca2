#[macro_use]
extern crate log;

#[cfg(not(unix))]
compile_error!("tunnelman relies on unix process groups and signals");

pub mod cli;
pub mod env;
pub mod error;
mod file;
pub mod logger;
pub mod output;
pub mod pid_ledger;
pub mod procs;
pub mod registry;
pub mod ssh_config;
pub mod supervisor;
pub mod tunnel;
pub mod tunnel_status;
pub mod tunnels_toml;
pub mod ui;

pub use miette::Result;
