//! CLI command definitions
//!
//! Defines the clap commands for the testrig CLI.

use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::common::config::Isolation;

/// What to load, shared by every command that loads a package
#[derive(Args, Debug, Clone)]
pub struct PackageArgs {
    /// Test assemblies to load
    #[arg(required = true)]
    pub assemblies: Vec<PathBuf>,

    /// Load only this test (full name of a suite or case)
    #[arg(long)]
    pub test: Option<String>,

    /// Directory relative assembly paths are resolved against
    #[arg(long)]
    pub base: Option<PathBuf>,

    /// Configuration file handed to the loaded assemblies
    #[arg(long)]
    pub config_file: Option<PathBuf>,

    /// Package setting as key=value, can be repeated
    #[arg(long = "setting", short = 's', value_name = "KEY=VALUE")]
    pub settings: Vec<String>,

    /// Isolation strategy: context or process
    #[arg(long)]
    pub isolation: Option<Isolation>,

    /// Load assemblies in place instead of from a shadow copy
    #[arg(long)]
    pub no_shadow_copy: bool,

    /// Also report skipped cases, captured output and stack traces
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load assemblies and run their tests
    Run {
        #[command(flatten)]
        package: PackageArgs,

        /// Category filter, e.g. "Fast,Unit-Slow"
        #[arg(long = "where", short = 'w')]
        filter: Option<String>,

        /// Keep running and rerun whenever an assembly changes
        #[arg(long)]
        watch: bool,
    },

    /// Load assemblies and print the test tree
    #[command(alias = "ls")]
    List {
        #[command(flatten)]
        package: PackageArgs,

        /// Category filter, only matching cases are listed
        #[arg(long = "where", short = 'w')]
        filter: Option<String>,
    },

    /// Run as an agent process (internal use)
    #[command(hide = true)]
    Agent {
        /// Address of the agency to register with
        #[arg(long)]
        agency: String,

        /// Identifier assigned by the agency
        #[arg(long)]
        agent_id: u64,
    },
}
