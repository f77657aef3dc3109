use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::DeliveryConfig;
use crate::error::AuditError;
use crate::filter::Finding;
use crate::output;

pub const REPORT_BODY: &str = "Attached are the unexpected open ports with their respective IPs:";

/// What is handed to a delivery backend once the report has findings.
#[derive(Debug, Clone)]
pub struct Report {
    pub path: PathBuf,
    pub subject: String,
    pub body: String,
    pub hosts: usize,
    pub ports: usize,
}

#[async_trait]
pub trait Delivery: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, report: &Report) -> Result<(), AuditError>;
}

/// Runs an operator supplied shell command (a mailer, an upload, a webhook call).
pub struct CommandDelivery {
    command: String,
    from: Option<String>,
    to: Option<String>,
}

impl CommandDelivery {
    pub fn new(command: String, from: Option<String>, to: Option<String>) -> Self {
        Self { command, from, to }
    }

    fn shell(&self) -> Command {
        #[cfg(target_os = "windows")]
        let (program, flag) = ("cmd", "/C");
        #[cfg(not(target_os = "windows"))]
        let (program, flag) = ("sh", "-c");

        let mut cmd = Command::new(program);
        cmd.arg(flag).arg(&self.command);
        cmd
    }
}

#[async_trait]
impl Delivery for CommandDelivery {
    fn name(&self) -> &str {
        "command"
    }

    async fn deliver(&self, report: &Report) -> Result<(), AuditError> {
        let mut cmd = self.shell();
        cmd.env("REPORT_PATH", &report.path)
            .env("REPORT_SUBJECT", &report.subject)
            .env("REPORT_BODY", &report.body)
            .env("REPORT_HOSTS", report.hosts.to_string())
            .env("REPORT_PORTS", report.ports.to_string())
            .env("REPORT_FROM", self.from.as_deref().unwrap_or(""))
            .env("REPORT_TO", self.to.as_deref().unwrap_or(""))
            .kill_on_drop(true);

        let output = cmd
            .output()
            .await
            .map_err(|e| AuditError::DeliveryFailed(format!("cannot run `{}`: {}", self.command, e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AuditError::DeliveryFailed(format!(
                "`{}` exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }
        info!("report {:?} delivered via `{}`", report.path, self.command);
        Ok(())
    }
}

/// Fallback when nothing is configured: leaves the report on disk and says so loudly.
pub struct LogDelivery;

#[async_trait]
impl Delivery for LogDelivery {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, report: &Report) -> Result<(), AuditError> {
        warn!(
            "{}: {} unexpected port(s) on {} host(s), report at {:?} (no --deliver-cmd configured)",
            report.subject, report.ports, report.hosts, report.path
        );
        Ok(())
    }
}

pub fn from_config(config: &DeliveryConfig) -> Box<dyn Delivery> {
    match &config.command {
        Some(command) => Box::new(CommandDelivery::new(
            command.clone(),
            config.from.clone(),
            config.to.clone(),
        )),
        None => Box::new(LogDelivery),
    }
}

pub fn build_report(path: &Path, subject: &str, hosts: usize, ports: usize) -> Report {
    Report {
        path: path.to_path_buf(),
        subject: subject.to_string(),
        body: REPORT_BODY.to_string(),
        hosts,
        ports,
    }
}

/// Writes the report and hands it to `backend` when it holds findings.
/// Returns whether anything was delivered.
pub async fn publish_report(
    findings: &[Finding],
    path: &Path,
    subject: &str,
    backend: &dyn Delivery,
) -> Result<bool, AuditError> {
    if !output::write_report(findings, path)? {
        info!("no unexpected open ports, nothing to deliver");
        return Ok(false);
    }
    let ports = findings.iter().map(|f| f.ports.len()).sum();
    let report = build_report(path, subject, findings.len(), ports);
    info!("delivering report through {} backend", backend.name());
    backend.deliver(&report).await?;
    Ok(true)
}
