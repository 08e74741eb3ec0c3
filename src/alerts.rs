//! # Alert Notifier
//!
//! Fire-and-forget notifications for the installation's owner. Callers hand
//! a message to the handle and move on; delivery happens on a worker task and
//! can never block or fail the message-handling path. The worker is where an
//! SMS or push provider would be wired in; this build logs the alert text.

use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Critical,
}

#[derive(Debug)]
struct Alert {
    severity: Severity,
    message: String,
}

/// Cheaply cloneable handle to the alert worker.
#[derive(Debug, Clone)]
pub struct Alerts {
    tx: mpsc::UnboundedSender<Alert>,
}

impl Alerts {
    /// Starts the delivery worker and returns its handle.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Alert>();
        tokio::spawn(async move {
            while let Some(alert) = rx.recv().await {
                match alert.severity {
                    Severity::Info => info!("Sending alert [INFO] {}", alert.message),
                    Severity::Critical => error!("Sending alert [CRITICAL] {}", alert.message),
                }
            }
        });
        Alerts { tx }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.send(Severity::Info, message.into());
    }

    pub fn critical(&self, message: impl Into<String>) {
        self.send(Severity::Critical, message.into());
    }

    fn send(&self, severity: Severity, message: String) {
        // Delivery failure must never propagate to the caller.
        if self.tx.send(Alert { severity, message }).is_err() {
            warn!("Alert worker is gone, dropping alert");
        }
    }
}
