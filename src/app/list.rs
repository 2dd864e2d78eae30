use std::path::PathBuf;

use crate::Result;
use crate::cli::ListArgs;
use crate::core::operations;
use crate::core::options::ListOptions;

use super::common::emit_diagnostics;

pub fn handle_list(_args: ListArgs, state_root: Option<&PathBuf>) -> Result<()> {
    let options = ListOptions {
        state_root: state_root.cloned(),
    };

    let output = operations::list(options, None)?;
    emit_diagnostics(&output.diagnostics);

    if output.value.ranges.is_empty() {
        println!("No ranges recorded.");
        return Ok(());
    }

    println!(
        "{:<20} {:<12} {:>6} {:>4} {:>6}  {}",
        "RANGE", "STATE", "GUESTS", "UP", "FAILED", "CREATED"
    );
    for range in &output.value.ranges {
        println!(
            "{:<20} {:<12} {:>6} {:>4} {:>6}  {}",
            range.id,
            range.state.describe(),
            range.guest_total,
            range.guest_active,
            range.guest_failed,
            range.created_at
        );
    }
    Ok(())
}
