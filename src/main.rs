mod config;
mod delivery;
mod error;
mod filter;
mod logging;
mod output;
mod scanner;
mod target;

use anyhow::Result;
use clap::Parser;
use crate::config::{Cli, ScanConfig};
use crate::error::{AuditError, ErrorSeverity};
use crate::filter::AllowList;
use std::process;
use tracing::{error, info, warn};

fn main() {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("cannot start runtime: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(async_main(cli)) {
        process::exit(report_failure(&e));
    }
}

/// Logs a pipeline failure and picks the exit code for the stage that failed.
fn report_failure(e: &anyhow::Error) -> i32 {
    match e.downcast_ref::<AuditError>() {
        Some(audit_err) => {
            match audit_err.severity() {
                ErrorSeverity::Critical | ErrorSeverity::High => error!("{:#}", e),
                ErrorSeverity::Medium => warn!("{:#}", e),
            }
            if let Some(hint) = audit_err.user_hint() {
                eprintln!("{}", hint);
            }
            audit_err.exit_code()
        }
        None => {
            error!("{:#}", e);
            1
        }
    }
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = ScanConfig::from_cli(cli)?;

    let targets = target::resolve_targets(
        &config.targets,
        config.target_list.as_deref(),
        &config.exclude_hosts,
        config.public_only,
    )
    .await
    .map_err(|e| AuditError::InvalidTarget(format!("{:#}", e)))?;
    if targets.is_empty() {
        return Err(AuditError::NoTargets.into());
    }
    info!("{} address(es) to audit", targets.len());

    let results = scanner::run_scan(&config, &targets).await;

    let findings = AllowList::new(&config.allowed_ports).unexpected(&results);
    if !config.quiet {
        output::print_human_readable(&results, &findings);
    }

    if let Some(path) = &config.json_path {
        if let Err(e) = output::write_json(&findings, path) {
            warn!("JSON output failed: {:#}", e);
        }
    }

    let backend = delivery::from_config(&config.delivery);
    delivery::publish_report(
        &findings,
        &config.report_path,
        &config.delivery.subject,
        backend.as_ref(),
    )
    .await?;

    println!("Done.");
    Ok(())
}
