//! Error logging utilities for better miette formatting in tracing

/// Log an error followed by every error in its cause chain
#[macro_export]
macro_rules! log_error_chain {
    (@causes $err:expr) => {{
        use std::error::Error as _;
        let mut depth = 1;
        let mut next = $err.source();
        if next.is_some() {
            tracing::error!("Caused by:");
        }
        while let Some(cause) = next {
            tracing::error!("  {}: {}", depth, cause);
            next = cause.source();
            depth += 1;
        }
    }};
    ($err:expr) => {{
        let err = &$err;
        tracing::error!("{}", err);
        $crate::log_error_chain!(@causes err);
    }};
    ($msg:expr, $err:expr) => {{
        let err = &$err;
        tracing::error!("{}: {}", $msg, err);
        $crate::log_error_chain!(@causes err);
    }};
}

/// Helper trait to format errors nicely for logging
pub trait ErrorLogging {
    /// Format the error with its full chain for logging
    fn log_format(&self) -> String;
}

impl<E: std::error::Error + ?Sized> ErrorLogging for E {
    fn log_format(&self) -> String {
        use std::fmt::Write;
        let mut output = self.to_string();

        let mut next = self.source();
        if next.is_some() {
            output.push_str("\n\nCaused by:");
        }
        let mut depth = 1;
        while let Some(cause) = next {
            let _ = write!(output, "\n  {}: {}", depth, cause);
            next = cause.source();
            depth += 1;
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MigrationError;
    use crate::id::{DocumentKey, ModelUuid};
    use crate::store::StoreError;

    fn import_failure() -> MigrationError {
        let uuid = ModelUuid::generate();
        MigrationError::ImportFailed {
            uuid,
            cause: StoreError::Backend {
                operation: "write_transaction".to_string(),
                cause: Box::new(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                )),
            },
        }
    }

    #[test]
    fn test_log_format_includes_chain() {
        let formatted = import_failure().log_format();
        assert!(formatted.contains("Caused by:"));
        assert!(formatted.contains("1: Store backend failure during write_transaction"));
        assert!(formatted.contains("2: connection reset by peer"));
    }

    #[test]
    fn test_log_format_without_source() {
        let err = StoreError::DocumentMissing {
            key: DocumentKey::model(&ModelUuid::generate()),
        };
        assert!(!err.log_format().contains("Caused by:"));
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_log_error_chain_macro() {
        crate::log_error_chain!("Rollback failed", import_failure());
        assert!(logs_contain("Rollback failed"));
        assert!(logs_contain("Caused by:"));
        assert!(logs_contain("2: connection reset by peer"));
    }
}
