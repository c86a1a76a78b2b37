//! Command-line driver for the workbench sync layer and proxy.

pub mod cli;
pub mod workspaces;
