use std::path::PathBuf;

use crate::Result;
use crate::cli::CreateArgs;
use crate::core::model::RangeState;
use crate::core::operations;
use crate::core::options::{CreateOptions, SpecSource};
use crate::core::outcome::CreateOutcome;

use super::common::{emit_diagnostics, render_events, render_guest_rows};

pub fn handle_create(args: CreateArgs, state_root: Option<&PathBuf>) -> Result<()> {
    let CreateArgs { spec, plan, force } = args;

    let options = CreateOptions {
        spec: SpecSource::Explicit(spec),
        state_root: state_root.cloned(),
        plan_only: plan,
        force,
    };

    let output = operations::create(options, None)?;
    emit_diagnostics(&output.diagnostics);
    render_events(&output.events);
    render_create(&output.value);
    Ok(())
}

fn render_create(outcome: &CreateOutcome) {
    if outcome.plan_only {
        println!(
            "Range `{}` plans to {} step(s); nothing was created.",
            outcome.range_id, outcome.plan_steps
        );
        return;
    }

    println!();
    println!(
        "Range `{}` is {} ({} guest(s)).",
        outcome.range_id,
        outcome.state.describe(),
        outcome.guests.len()
    );
    render_guest_rows(&outcome.guests);

    if !outcome.credentials.is_empty() {
        println!();
        println!("Generated credentials:");
        for credential in &outcome.credentials {
            println!(
                "  {} (task {}): {}",
                credential.guest, credential.task, credential.password
            );
        }
    }

    if !outcome.errors.is_empty() {
        eprintln!();
        eprintln!("Failures, grouped by resource:");
        for error in &outcome.errors {
            eprintln!(
                "  [{}] {} ({}): {}",
                error.kind.label(),
                error.resource,
                error.component,
                error.message
            );
        }
    }

    if outcome.state == RangeState::Failed {
        eprintln!();
        eprintln!(
            "A critical task failed; the range was torn down and left `failed` for inspection."
        );
    }
}
