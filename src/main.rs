//! Spindle — a static site generator driven by a small user-extensible
//! markup language.

mod assets;
mod build;
mod cli;
mod config;
mod date;
mod errors;
mod finder;
mod hash;
mod init;
mod logger;
mod markup;
mod render;
mod scope;
mod serve;
mod site;
mod sitemap;
mod text;
mod tree;
mod watch;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use config::Config;
use errors::Diagnostics;
use site::{BuildState, Context};
use std::path::Path;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            log!("error"; "{err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Dispatch one command; the bool is "no failure diagnostics".
fn run(cli: Cli) -> Result<bool> {
    let root = Path::new(".");

    match cli.command {
        Commands::Init => {
            init::scaffold(root)?;
            Ok(true)
        }

        Commands::Build {
            public_dir,
            build_args,
        } => {
            let config = Config::load(root)?;
            let mut errors = Diagnostics::new();

            let mut ctx = Context::load(root, config, public_dir.as_deref(), &mut errors)?;
            ctx.build_drafts = build_args.drafts;
            ctx.skip_images = build_args.skip_images;
            ctx.only_used = build_args.only_used;

            let mut state = BuildState::new();
            state.errors = errors;

            build::build_site(&ctx, &mut state)?;

            if state.errors.has_errors() {
                eprintln!("{}", state.errors.render_term());
            }
            if !state.errors.has_failures() {
                log!("build"; "done");
            }

            Ok(!state.errors.has_failures())
        }

        Commands::Serve { build_args, port } => {
            let mut config = Config::load(root)?;
            if let Some(port) = port {
                config.port = port;
            }

            let mut errors = Diagnostics::new();
            let mut ctx = Context::load(root, config, None, &mut errors)?;
            ctx.build_drafts = build_args.drafts;
            ctx.skip_images = build_args.skip_images;

            if errors.has_errors() {
                eprintln!("{}", errors.render_term());
            }

            tokio::runtime::Runtime::new()?.block_on(serve::serve_site(ctx))?;
            Ok(true)
        }
    }
}
