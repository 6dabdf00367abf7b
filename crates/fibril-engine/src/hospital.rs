// Copyright (C) 2025 Fibril Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Failure triage for initialized flows.
//!
//! When a flow with a committed checkpoint errors, the engine rolls the
//! failed step back and admits the run here. An ordered chain of
//! [`Specialist`]s examines the error; the first one to claim the patient
//! decides the [`Diagnosis`]. Unclaimed patients are terminal.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::FlowError;
use crate::state::FlowRunId;

/// What the hospital decided to do with an admitted run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnosis {
    /// Respawn from the last committed checkpoint after a backoff.
    Retry {
        /// How long to wait before the respawn.
        backoff: Duration,
    },
    /// Park the run under `Hospitalized` until an operator intervenes.
    Quarantine,
    /// Give up: propagate the error and fail the run.
    Terminal,
}

/// One specialist's verdict on a patient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opinion {
    /// This specialist does not recognize the condition; ask the next one.
    NotMyPatient,
    /// A definitive diagnosis. Ends the consultation.
    Diagnosed(Diagnosis),
}

/// A single admission as seen by a specialist.
#[derive(Debug, Clone)]
pub struct Admission {
    /// The run being examined.
    pub run_id: FlowRunId,
    /// The error that brought the run in.
    pub error: FlowError,
    /// How many times this run has been admitted, this one included.
    pub attempt: u32,
}

/// A member of the triage chain.
pub trait Specialist: Send + Sync {
    /// Name used in medical records and logs.
    fn name(&self) -> &'static str;

    /// Examine an admission and either diagnose it or pass.
    fn examine(&self, admission: &Admission) -> Opinion;
}

/// Backoff schedule for retried admissions.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Admissions beyond this count are no longer retried.
    pub ceiling: u32,
    /// Base delay, doubled on each further attempt.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before the given attempt (1-indexed): `base_delay * 2^(n-1)`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis((self.base_delay.as_millis() as u64).saturating_mul(multiplier))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            ceiling: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

/// Recognizes transient infrastructure faults anywhere in the cause chain
/// and retries them up to the policy ceiling, then quarantines.
pub struct TransientFaultSpecialist {
    policy: RetryPolicy,
}

impl TransientFaultSpecialist {
    /// Build a specialist with the given backoff policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

impl Specialist for TransientFaultSpecialist {
    fn name(&self) -> &'static str {
        "transient-fault"
    }

    fn examine(&self, admission: &Admission) -> Opinion {
        if !admission.error.is_transient() {
            return Opinion::NotMyPatient;
        }
        if admission.attempt > self.policy.ceiling {
            return Opinion::Diagnosed(Diagnosis::Quarantine);
        }
        Opinion::Diagnosed(Diagnosis::Retry {
            backoff: self.policy.backoff_for_attempt(admission.attempt),
        })
    }
}

/// One line of a run's medical history.
#[derive(Debug, Clone)]
pub struct MedicalRecord {
    /// Admission number, starting at 1.
    pub attempt: u32,
    /// The error the run was admitted with.
    pub error: FlowError,
    /// The diagnosis reached.
    pub outcome: Diagnosis,
    /// When the consultation happened.
    pub at: DateTime<Utc>,
}

struct PatientFile {
    admissions: u32,
    records: Vec<MedicalRecord>,
}

/// The triage authority.
///
/// Owns the specialist chain and the per-run medical records. Consultation
/// order is the registration order; the first specialist to return
/// [`Opinion::Diagnosed`] decides.
pub struct FlowHospital {
    specialists: Vec<Box<dyn Specialist>>,
    patients: Mutex<std::collections::HashMap<FlowRunId, PatientFile>>,
}

impl FlowHospital {
    /// Standard hospital: transient faults retried with the given policy,
    /// everything else terminal.
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_specialists(vec![Box::new(TransientFaultSpecialist::new(policy))])
    }

    /// Hospital with a custom specialist chain.
    pub fn with_specialists(specialists: Vec<Box<dyn Specialist>>) -> Self {
        Self {
            specialists,
            patients: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Strict-mode hospital: every admission is terminal, nothing retried.
    pub fn propagating() -> Self {
        Self::with_specialists(Vec::new())
    }

    /// Admit an errored run and decide what happens to it.
    pub async fn flow_errored(&self, run_id: FlowRunId, error: FlowError) -> Diagnosis {
        let mut patients = self.patients.lock().await;
        let file = patients.entry(run_id).or_insert_with(|| PatientFile {
            admissions: 0,
            records: Vec::new(),
        });
        file.admissions += 1;
        let admission = Admission {
            run_id,
            error: error.clone(),
            attempt: file.admissions,
        };

        let mut outcome = Diagnosis::Terminal;
        for specialist in &self.specialists {
            match specialist.examine(&admission) {
                Opinion::NotMyPatient => continue,
                Opinion::Diagnosed(diagnosis) => {
                    outcome = diagnosis;
                    break;
                }
            }
        }

        match &outcome {
            Diagnosis::Retry { backoff } => info!(
                run_id = %run_id,
                attempt = admission.attempt,
                backoff_ms = backoff.as_millis() as u64,
                "flow admitted, scheduling retry"
            ),
            Diagnosis::Quarantine => warn!(
                run_id = %run_id,
                attempt = admission.attempt,
                "flow admitted, keeping under observation"
            ),
            Diagnosis::Terminal => warn!(
                run_id = %run_id,
                attempt = admission.attempt,
                error = %error,
                "flow admitted, no specialist claimed it"
            ),
        }

        file.records.push(MedicalRecord {
            attempt: admission.attempt,
            error,
            outcome: outcome.clone(),
            at: Utc::now(),
        });
        outcome
    }

    /// The admission history for a run. Empty if it was never admitted.
    pub async fn medical_history(&self, run_id: FlowRunId) -> Vec<MedicalRecord> {
        let patients = self.patients.lock().await;
        patients
            .get(&run_id)
            .map(|file| file.records.clone())
            .unwrap_or_default()
    }

    /// Drop a run's records once the run is gone.
    pub async fn discharge(&self, run_id: FlowRunId) {
        let mut patients = self.patients.lock().await;
        patients.remove(&run_id);
    }
}
