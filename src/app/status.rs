use std::path::PathBuf;

use crate::Result;
use crate::cli::StatusArgs;
use crate::core::operations;
use crate::core::options::StatusOptions;

use super::common::{emit_diagnostics, render_guest_rows};

pub fn handle_status(args: StatusArgs, state_root: Option<&PathBuf>) -> Result<()> {
    let options = StatusOptions {
        range_id: args.range_id,
        state_root: state_root.cloned(),
    };

    let output = operations::status(options, None)?;
    emit_diagnostics(&output.diagnostics);

    let summary = &output.value.summary;
    println!(
        "{} ({}) [{}] created {}",
        summary.id,
        summary.name,
        summary.state.describe(),
        summary.created_at
    );
    if let Some(owner) = &summary.owner {
        println!("owner: {owner}");
    }
    println!(
        "guests: {} total, {} up, {} failed",
        summary.guest_total, summary.guest_active, summary.guest_failed
    );
    render_guest_rows(&output.value.guests);
    Ok(())
}
