use serde::Serialize;
use crate::error::AuditError;
use crate::filter::Finding;
use crate::scanner::service_map;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::IpAddr;
use std::path::Path;
use colored::*;

#[derive(Debug, Serialize, Clone)]
pub struct HostScanResult {
    pub target: String,
    pub ip: IpAddr,
    pub open_ports: Vec<u16>,
    pub closed: usize,
    pub filtered: usize,
    pub elapsed_ms: u64,
}

fn file_error(path: &Path, source: std::io::Error) -> AuditError {
    AuditError::FileError {
        path: path.to_path_buf(),
        source,
    }
}

/// Renders findings in the plain text report format.
pub fn render_report<W: Write>(findings: &[Finding], mut out: W) -> std::io::Result<bool> {
    let mut written = false;
    for finding in findings {
        if finding.ports.is_empty() {
            continue;
        }
        writeln!(out, "-- IP: {}", finding.ip)?;
        for port in &finding.ports {
            match service_map::get_service_name(*port) {
                Some(name) => writeln!(out, "     • Port: {} ({})", port, name)?,
                None => writeln!(out, "     • Port: {}", port)?,
            }
        }
        written = true;
    }
    Ok(written)
}

/// Writes the report file, truncating any previous run.
/// Returns whether the report holds at least one finding.
pub fn write_report(findings: &[Finding], path: &Path) -> Result<bool, AuditError> {
    let file = File::create(path).map_err(|e| file_error(path, e))?;
    let mut writer = BufWriter::new(file);
    let written = render_report(findings, &mut writer).map_err(|e| file_error(path, e))?;
    writer.flush().map_err(|e| file_error(path, e))?;
    Ok(written)
}

pub fn write_json(findings: &[Finding], path: &Path) -> anyhow::Result<()> {
    let file = File::create(path).map_err(|e| file_error(path, e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, findings)?;
    writer.flush().map_err(|e| file_error(path, e))?;
    Ok(())
}

pub fn print_human_readable(results: &[HostScanResult], findings: &[Finding]) {
    for res in results {
        let finding = findings.iter().find(|f| f.ip == res.ip);
        let status = match finding {
            Some(f) => format!("{} unexpected", f.ports.len()).red().bold(),
            None => "clean".green(),
        };
        println!(
            "{:<40} {:<14} open: {:<5} closed: {:<6} filtered: {:<6}",
            format!("{} ({})", res.target.bold().blue(), res.ip.to_string().yellow()),
            status,
            res.open_ports.len(),
            res.closed,
            res.filtered
        );
        if let Some(f) = finding {
            for port in &f.ports {
                let service = service_map::get_service_name(*port).unwrap_or("unknown");
                println!("  └── {}/tcp {}", port.to_string().red(), service.dimmed());
            }
        }
    }
    let unexpected: usize = findings.iter().map(|f| f.ports.len()).sum();
    println!("\n{}", "Scan summary:".bold().underline());
    println!("  Addresses scanned: {}", results.len().to_string().cyan());
    println!("  Hosts with unexpected ports: {}", findings.len().to_string().cyan());
    if unexpected > 0 {
        println!("  Unexpected open ports: {}", unexpected.to_string().red());
    } else {
        println!("  Unexpected open ports: {}", "0".green());
    }
}
