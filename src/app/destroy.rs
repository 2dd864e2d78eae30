use std::path::PathBuf;

use crate::Result;
use crate::cli::DestroyArgs;
use crate::core::operations;
use crate::core::options::DestroyOptions;

use super::common::{emit_diagnostics, render_events};

pub fn handle_destroy(args: DestroyArgs, state_root: Option<&PathBuf>) -> Result<()> {
    let DestroyArgs { range_id, purge } = args;

    let options = DestroyOptions {
        range_id,
        state_root: state_root.cloned(),
        purge,
    };

    let output = operations::destroy(options, None)?;
    emit_diagnostics(&output.diagnostics);
    render_events(&output.events);

    let outcome = &output.value;
    if outcome.errors.is_empty() {
        println!(
            "Range `{}` is {}{}.",
            outcome.range_id,
            outcome.state.describe(),
            if outcome.purged { " and purged" } else { "" }
        );
    } else {
        eprintln!(
            "Range `{}` destruction finished with {} failure(s):",
            outcome.range_id,
            outcome.errors.len()
        );
        for error in &outcome.errors {
            eprintln!(
                "  [{}] {}: {}",
                error.kind.label(),
                error.resource,
                error.message
            );
        }
    }
    Ok(())
}
