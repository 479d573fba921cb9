mod cli;
mod commands;
mod engine;
mod facts;
mod manifest;
mod paths;
mod progress;
mod resource;
mod sudo;
mod template;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command, ManifestCommand};
use std::io;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let manifest_flag = cli.manifest.as_deref();

    match cli.command {
        Command::Plan(args) => {
            commands::plan::run(manifest_flag, args.target.as_deref(), args.diff)
        }
        Command::Apply(args) => commands::apply::run(
            manifest_flag,
            &commands::apply::ApplyOptions {
                target: args.target.as_deref(),
                dry_run: args.dry_run,
                yes: args.yes,
                jobs: args.jobs,
                rollback: if args.no_rollback {
                    Some("none")
                } else {
                    args.rollback.as_deref()
                },
                verbose: cli.verbose > 0,
            },
        ),
        Command::Status(args) => {
            let converged =
                commands::status::run(manifest_flag, args.target.as_deref(), args.json)?;
            if !converged {
                // Drift is signal, not error: distinct exit code for scripts
                std::process::exit(2);
            }
            Ok(())
        }
        Command::Facts(args) => commands::facts::run(args.json, args.local),
        Command::Manifest(cmd) => match cmd {
            ManifestCommand::Validate => commands::manifest::validate(manifest_flag),
            ManifestCommand::Init {
                app_name,
                path,
                force,
            } => commands::manifest::init(&app_name, &path, force),
        },
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut io::stdout());
            Ok(())
        }
    }
}
