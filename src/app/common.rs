use crate::core::diagnostics::{Diagnostic, Scope, Severity};
use crate::core::events::Event;
use crate::core::model::TaskState;
use crate::core::outcome::GuestRow;

pub fn emit_diagnostics(diagnostics: &[Diagnostic]) {
    for diagnostic in diagnostics {
        // Controller-scoped findings read fine bare; anything anchored to
        // a range entity carries its coordinates.
        let location = match &diagnostic.scope {
            Scope::Controller => String::new(),
            scope => format!("{scope}: "),
        };
        match diagnostic.severity {
            Severity::Warning => {
                eprintln!("Warning: {location}{}", diagnostic.message);
                if let Some(help) = &diagnostic.help {
                    eprintln!("         {help}");
                }
            }
            Severity::Info => {
                println!("{location}{}", diagnostic.message);
                if let Some(help) = &diagnostic.help {
                    println!("{help}");
                }
            }
            Severity::Error => {
                eprintln!("Error: {location}{}", diagnostic.message);
                if let Some(help) = &diagnostic.help {
                    eprintln!("       {help}");
                }
            }
        }
    }
}

/// Render the structured event stream the way the operator expects to
/// read a deploy log: one line per meaningful transition.
pub fn render_events(events: &[Event]) {
    for event in events {
        match event {
            Event::Message { severity, text } => match severity {
                Severity::Warning | Severity::Error => eprintln!("{text}"),
                Severity::Info => println!("{text}"),
            },
            Event::PlanEmitted { range, steps, .. } => {
                println!("Plan for `{range}`: {steps} step(s).");
            }
            Event::ImageTransferStarted {
                fingerprint,
                host,
                bytes,
            } => {
                let short = &fingerprint[..12.min(fingerprint.len())];
                println!("Transferring image {short}… to {host} ({bytes} bytes).");
            }
            Event::ImagePlaced {
                fingerprint,
                host,
                already_present,
                ..
            } => {
                let short = &fingerprint[..12.min(fingerprint.len())];
                if *already_present {
                    println!("Image {short}… already on {host}.");
                } else {
                    println!("Image {short}… placed on {host}.");
                }
            }
            Event::ImageVerificationFailed {
                host, will_retry, ..
            } => {
                eprintln!(
                    "Image verification failed on {host}{}.",
                    if *will_retry { "; retrying from another seed" } else { "" }
                );
            }
            Event::OverlayCreated { guest, .. } => {
                println!("Overlay ready for {guest}.");
            }
            Event::GuestCloned { guest, host, .. } => {
                println!("Guest {guest} cloned on {host}.");
            }
            Event::BootReady {
                guest,
                leased_ips,
                elapsed_ms,
            } => {
                if leased_ips.is_empty() {
                    println!("Guest {guest} booted ({:.1}s).", *elapsed_ms as f64 / 1000.0);
                } else {
                    println!(
                        "Guest {guest} booted ({:.1}s): {}",
                        *elapsed_ms as f64 / 1000.0,
                        leased_ips.join(", ")
                    );
                }
            }
            Event::TaskStarted { guest, task, kind, .. } => {
                println!("Task {task} ({kind}) on {guest}…");
            }
            Event::TaskCompleted {
                guest,
                task,
                status,
                duration_ms,
                ..
            } => {
                println!(
                    "Task {task} on {guest}: {} ({:.1}s).",
                    status.describe(),
                    *duration_ms as f64 / 1000.0
                );
            }
            Event::ShutdownRequested { guest } => println!("Stopping {guest}…"),
            Event::ShutdownEscalated { guest, waited_ms } => println!(
                "Guest {guest} did not stop within {:.0}s; forcing off.",
                *waited_ms as f64 / 1000.0
            ),
            Event::ShutdownComplete { .. } => {}
            Event::GuestDestroyed { guest, host } => {
                println!("Guest {guest} destroyed on {host}.");
            }
            Event::NetworkDestroyed { network, host } => {
                println!("Network {network} removed from {host}.");
            }
            Event::RangeStateChanged { range, state } => {
                println!("Range {range} → {state}.");
            }
            Event::OrphanDetected {
                host,
                domain,
                action,
            } => {
                println!("Orphan {domain} on {host}: {action:?}.");
            }
            Event::PhantomDetected { range, guest, host } => {
                println!("Phantom: {range}/{guest} has no domain on {host}.");
            }
            Event::CleanupProgress {
                path,
                kind,
                bytes,
                dry_run,
            } => {
                println!(
                    "{}{} {} ({bytes} bytes).",
                    if *dry_run { "[dry-run] " } else { "" },
                    kind.describe(),
                    path.display()
                );
            }
        }
    }
}

pub fn render_guest_rows(guests: &[GuestRow]) {
    for guest in guests {
        let addresses = if guest.addresses.is_empty() {
            "-".to_string()
        } else {
            guest.addresses.join(",")
        };
        println!(
            "  {:<16} {:<8} {:<18} {}",
            guest.id,
            guest.host,
            guest.state.describe(),
            addresses
        );
        for task in &guest.tasks {
            let marker = match task.state {
                TaskState::Succeeded => "ok",
                TaskState::Failed => "FAILED",
                TaskState::SkippedUpstreamFailed => "skipped",
                TaskState::Pending => "pending",
                TaskState::Running => "running",
            };
            println!("    task {:<14} {:<14} {marker}", task.id, task.kind);
        }
    }
}
