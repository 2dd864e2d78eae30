mod app;
mod cli;

use std::process::ExitCode;

use clap::{CommandFactory, Parser, error::ErrorKind};

use crate::cli::{Cli, Commands};
pub use cyris::{Error, Result, core};

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(64),
            };
        }
    };

    let Cli {
        state_root,
        command,
    } = cli;

    let command = match command {
        Some(cmd) => cmd,
        None => {
            let mut command = Cli::command();
            let _ = command.print_help();
            println!();
            return ExitCode::from(64);
        }
    };

    let exit = match command {
        Commands::Create(args) => app::handle_create(args, state_root.as_ref()),
        Commands::Destroy(args) => app::handle_destroy(args, state_root.as_ref()),
        Commands::Status(args) => app::handle_status(args, state_root.as_ref()),
        Commands::List(args) => app::handle_list(args, state_root.as_ref()),
        Commands::Cleanup(args) => app::handle_cleanup(args, state_root.as_ref()),
    };

    match exit {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            app::error::exit_code(&err)
        }
    }
}
