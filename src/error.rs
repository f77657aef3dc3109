use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("invalid port range: {0}")]
    InvalidPortRange(String),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("no addresses to scan")]
    NoTargets,

    #[error("file operation failed: {path}")]
    FileError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("report delivery failed: {0}")]
    DeliveryFailed(String),
}

impl AuditError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            AuditError::ConfigError(_)
            | AuditError::InvalidPortRange(_)
            | AuditError::NoTargets => ErrorSeverity::Critical,
            AuditError::FileError { .. } | AuditError::DeliveryFailed(_) => ErrorSeverity::High,
            AuditError::InvalidTarget(_) => ErrorSeverity::Medium,
        }
    }

    /// Process exit code for an error that aborts the pipeline.
    pub fn exit_code(&self) -> i32 {
        match self {
            AuditError::ConfigError(_)
            | AuditError::InvalidPortRange(_)
            | AuditError::NoTargets => 1,
            AuditError::InvalidTarget(_) => 2,
            AuditError::FileError { .. } => 3,
            AuditError::DeliveryFailed(_) => 4,
        }
    }

    pub fn user_hint(&self) -> Option<String> {
        match self {
            AuditError::NoTargets => Some(
                "hint: pass addresses as TARGET arguments or export them to a file and use -L".to_string(),
            ),
            AuditError::DeliveryFailed(_) => {
                Some("hint: check --deliver-cmd; the report file was kept on disk".to_string())
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Critical,
    High,
    Medium,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_follow_stage() {
        assert_eq!(AuditError::ConfigError("x".into()).exit_code(), 1);
        assert_eq!(AuditError::InvalidTarget("x".into()).exit_code(), 2);
        let file_err = AuditError::FileError {
            path: PathBuf::from("open_ports.txt"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(file_err.exit_code(), 3);
        assert_eq!(AuditError::DeliveryFailed("exit 1".into()).exit_code(), 4);
    }

    #[test]
    fn test_severity() {
        assert_eq!(AuditError::NoTargets.severity(), ErrorSeverity::Critical);
        assert_eq!(
            AuditError::DeliveryFailed("x".into()).severity(),
            ErrorSeverity::High
        );
        assert!(AuditError::NoTargets.user_hint().is_some());
        assert!(AuditError::InvalidPortRange("1-0".into()).user_hint().is_none());
    }
}
