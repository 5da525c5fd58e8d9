//! Classifying relay for connection errors.

use crate::ClientError;
use smsrelay_core::ConnectionId;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The owning process is expected to stop.
    Fatal,
    /// Logged; processing continues.
    Recoverable,
}

/// An error together with the connection that raised it.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub connection: ConnectionId,
    pub error: ClientError,
}

impl ErrorReport {
    pub fn severity(&self) -> Severity {
        if self.error.is_fatal() {
            Severity::Fatal
        } else {
            Severity::Recoverable
        }
    }
}

/// Where connections send their errors.
///
/// Every report is logged. When built with [`ErrorSink::channel`] it is also
/// forwarded to whoever decides what a fatal error means for the process.
/// The sink never recovers anything itself.
#[derive(Debug, Clone, Default)]
pub struct ErrorSink {
    forward: Option<mpsc::UnboundedSender<ErrorReport>>,
}

impl ErrorSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ErrorReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { forward: Some(tx) }, rx)
    }

    /// A sink that only logs.
    pub fn logging_only() -> Self {
        Self::default()
    }

    pub fn report(&self, connection: ConnectionId, error: ClientError) -> Severity {
        let report = ErrorReport { connection, error };
        let severity = report.severity();
        match severity {
            Severity::Fatal => {
                tracing::error!(connection = %connection, error = %report.error, "fatal connection error")
            }
            Severity::Recoverable => {
                tracing::warn!(connection = %connection, error = %report.error, "connection error")
            }
        }
        if let Some(forward) = &self.forward
            && forward.send(report).is_err()
        {
            tracing::debug!(connection = %connection, "error report receiver is gone");
        }
        severity
    }
}
