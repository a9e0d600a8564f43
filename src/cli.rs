//! Command-line interface definitions.
//!
//! Defines all CLI arguments and subcommands using clap.

use clap::{Parser, Subcommand};

/// Spindle static site generator CLI
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None, arg_required_else_help = true)]
pub struct Cli {
    /// subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Shared build arguments for Build and Serve commands
#[derive(clap::Args, Debug, Clone, Default)]
pub struct BuildArgs {
    /// Include draft pages and assets
    #[arg(long)]
    pub drafts: bool,

    /// Skip generated-image processing entirely
    #[arg(long)]
    pub skip_images: bool,

    /// Only emit assets a page actually resolved
    #[arg(long)]
    pub only_used: bool,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Scaffold a minimal project in the current directory
    Init,

    /// Build the site once
    Build {
        /// Output directory (defaults to "public")
        public_dir: Option<String>,

        #[command(flatten)]
        build_args: BuildArgs,
    },

    /// Serve the site with live reload
    Serve {
        #[command(flatten)]
        build_args: BuildArgs,

        /// Port to bind on
        #[arg(short, long)]
        port: Option<u16>,
    },
}
