//! Pipeline rate reporting
//!
//! Every endpoint registration pairs the ingress worker counters with the
//! counters of the new egress worker in a `ServiceReport`. Reports observe
//! the counters with acquire loads; values are monotone and eventually
//! consistent, which is all a reporter needs.

use std::sync::Arc;

use crate::error::{ RelayError, Result };
use crate::worker::WorkerCounters;

/// Point-in-time view of one ingress/egress counter pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportSnapshot {
    /// Productive ingress poll iterations
    pub ingress_successful: u64,
    /// Empty ingress poll iterations
    pub ingress_failed: u64,
    /// Productive egress poll iterations
    pub egress_successful: u64,
    /// Empty egress poll iterations
    pub egress_failed: u64,
}

/// A reporting collaborator observing pipeline counters
pub trait RateReport: Send + Sync {
    /// Identifier of the endpoint this report covers
    fn label(&self) -> &str;

    /// Sample the current counter values
    fn snapshot(&self) -> ReportSnapshot;
}

/// Report pairing the ingress counters with one endpoint's egress counters
#[derive(Debug)]
pub struct ServiceReport {
    label: String,
    ingress: Arc<WorkerCounters>,
    egress: Arc<WorkerCounters>,
}

impl ServiceReport {
    /// Create a report; aliased counter handles are a usage error
    pub fn new(
        label: impl Into<String>,
        ingress: Arc<WorkerCounters>,
        egress: Arc<WorkerCounters>
    ) -> Result<Self> {
        let label = label.into();
        if label.is_empty() {
            return Err(RelayError::usage("service report label must not be empty"));
        }
        if Arc::ptr_eq(&ingress, &egress) {
            return Err(
                RelayError::usage("service report requires distinct ingress and egress counters")
            );
        }
        Ok(Self { label, ingress, egress })
    }
}

impl RateReport for ServiceReport {
    fn label(&self) -> &str {
        &self.label
    }

    fn snapshot(&self) -> ReportSnapshot {
        ReportSnapshot {
            ingress_successful: self.ingress.successful_reads(),
            ingress_failed: self.ingress.failed_reads(),
            egress_successful: self.egress.successful_reads(),
            egress_failed: self.egress.failed_reads(),
        }
    }
}
