//! Caller-owned diagnostics injection.
//!
//! Resolving metadata may ask a [`DiagnosticsSink`] to start forwarding traces
//! under the application's diagnostics key. The sink is passed in explicitly;
//! nothing is registered in process-wide state.

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
};

pub trait DiagnosticsSink: Send + Sync {
    /// Attaches a trace destination for `key`. Returns `false` when the key
    /// was already attached and nothing changed.
    fn attach(&self, key: &str) -> bool;
}

/// Records attached keys and announces each one once through `tracing`.
///
/// Clones share their key set, so one handle can be passed to every client
/// constructed in a process without duplicating sinks.
#[derive(Debug, Clone, Default)]
pub struct TracingDiagnostics {
    attached: Arc<Mutex<BTreeSet<String>>>,
}

impl TracingDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attached_keys(&self) -> Vec<String> {
        self.attached
            .lock()
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl DiagnosticsSink for TracingDiagnostics {
    fn attach(&self, key: &str) -> bool {
        if key.is_empty() {
            tracing::debug!("metadata carries no diagnostics key, nothing to attach");
            return false;
        }
        let Ok(mut keys) = self.attached.lock() else {
            tracing::warn!("diagnostics key set poisoned, skipping attachment");
            return false;
        };
        let added = keys.insert(key.to_string());
        if added {
            tracing::info!(diagnostics_key = %key, "diagnostics sink attached");
        }
        added
    }
}

/// Discards every attachment.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDiagnostics;

impl DiagnosticsSink for NoDiagnostics {
    fn attach(&self, _key: &str) -> bool {
        false
    }
}
