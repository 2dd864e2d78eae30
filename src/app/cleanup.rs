use std::path::PathBuf;

use crate::Result;
use crate::cli::CleanupArgs;
use crate::core::operations;
use crate::core::options::CleanupOptions;

use super::common::{emit_diagnostics, render_events};

pub fn handle_cleanup(args: CleanupArgs, state_root: Option<&PathBuf>) -> Result<()> {
    let CleanupArgs { grace, dry_run } = args;

    let options = CleanupOptions {
        state_root: state_root.cloned(),
        grace,
        dry_run,
    };

    let output = operations::cleanup(options, None)?;
    emit_diagnostics(&output.diagnostics);
    render_events(&output.events);

    let outcome = &output.value;
    println!(
        "{}{} orphan(s), {} phantom(s), {} stranded range(s), {} byte(s) of staging reclaimed.",
        if outcome.dry_run { "[dry-run] " } else { "" },
        outcome.orphans.len(),
        outcome.phantoms.len(),
        outcome.residue_destroyed.len(),
        outcome.staging_reclaimed_bytes
    );
    for error in &outcome.errors {
        eprintln!(
            "  [{}] {}: {}",
            error.kind.label(),
            error.resource,
            error.message
        );
    }
    Ok(())
}
