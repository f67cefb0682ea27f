use stowage_core::backend::VerifyMode;
use stowage_core::commands;
use stowage_core::config::StowageConfig;

pub(crate) fn run_verify(
    config: &StowageConfig,
    relaxed: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mode = if relaxed {
        VerifyMode::Relaxed
    } else {
        VerifyMode::Strict
    };
    let report = commands::verify(config, mode)?;

    println!("{} volume(s) verified", report.verified);
    for name in &report.completed_deletes {
        println!("  finished deleting {name}");
    }
    for name in &report.removed_temporary {
        println!("  removed leftover {name}");
    }
    for name in &report.missing {
        println!("  missing: {name}");
    }
    for name in &report.unknown {
        println!("  unknown: {name}");
    }
    Ok(())
}
