use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info, warn};

use crate::{
    configure::Configurator,
    ledger::RequestLedger,
    provision::Provisioner,
    topology::{ClusterState, PrimaryNode, ProvisionOutput},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilePhase {
    Idle,
    ComputingVerdict,
    Provisioning,
    Configuring,
    Verifying,
}

impl ReconcilePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ComputingVerdict => "computing_verdict",
            Self::Provisioning => "provisioning",
            Self::Configuring => "configuring",
            Self::Verifying => "verifying",
        }
    }
}

/// The last topology that was provisioned and verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedCluster {
    pub state: ClusterState,
    pub primary: PrimaryNode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergeOutcome {
    Skipped(AppliedCluster),
    Converged(AppliedCluster),
}

impl ConvergeOutcome {
    pub fn applied(&self) -> &AppliedCluster {
        match self {
            Self::Skipped(a) | Self::Converged(a) => a,
        }
    }
}

/// Why a cycle stopped short. Every variant leaves applied state untouched
/// and is retried by the next scheduled cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergeError {
    TerraformOperation {
        target: ClusterState,
        details: String,
    },
    ClusterSetup {
        target: ClusterState,
        details: String,
    },
    Configure {
        target: ClusterState,
        details: String,
    },
}

impl ConvergeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::TerraformOperation { .. } => "terraform_operation",
            Self::ClusterSetup { .. } => "cluster_setup",
            Self::Configure { .. } => "configure",
        }
    }

    pub fn target(&self) -> ClusterState {
        match self {
            Self::TerraformOperation { target, .. }
            | Self::ClusterSetup { target, .. }
            | Self::Configure { target, .. } => *target,
        }
    }
}

impl std::fmt::Display for ConvergeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TerraformOperation { target, details } => {
                write!(f, "terraform operation failed for {target}: {details}")
            }
            Self::ClusterSetup { target, details } => {
                write!(f, "cluster setup check failed for {target}: {details}")
            }
            Self::Configure { target, details } => {
                write!(f, "configuration failed for {target}: {details}")
            }
        }
    }
}

impl std::error::Error for ConvergeError {}

/// Drives infrastructure toward the ledger's verdict.
pub struct Reconciler {
    ledger: Arc<Mutex<RequestLedger>>,
    provisioner: Arc<dyn Provisioner>,
    configurator: Arc<dyn Configurator>,
    // Held for a whole cycle so provisioning calls never overlap.
    cycle_gate: Mutex<()>,
    applied: RwLock<Option<AppliedCluster>>,
    phase: watch::Sender<ReconcilePhase>,
}

impl Reconciler {
    pub fn new(
        ledger: Arc<Mutex<RequestLedger>>,
        provisioner: Arc<dyn Provisioner>,
        configurator: Arc<dyn Configurator>,
    ) -> Self {
        let (phase, _rx) = watch::channel(ReconcilePhase::Idle);
        Self {
            ledger,
            provisioner,
            configurator,
            cycle_gate: Mutex::new(()),
            applied: RwLock::new(None),
            phase,
        }
    }

    pub fn ledger(&self) -> &Arc<Mutex<RequestLedger>> {
        &self.ledger
    }

    pub async fn applied(&self) -> Option<AppliedCluster> {
        self.applied.read().await.clone()
    }

    pub fn phase(&self) -> ReconcilePhase {
        *self.phase.borrow()
    }

    /// Runs one convergence cycle. Callers that find a cycle in flight wait
    /// for it to finish and then run their own (usually a skip).
    pub async fn converge(&self) -> Result<ConvergeOutcome, ConvergeError> {
        let _gate = self.cycle_gate.lock().await;
        let result = self.converge_locked().await;
        self.phase.send_replace(ReconcilePhase::Idle);
        result
    }

    /// Like [`Reconciler::converge`], but returns `None` without touching any
    /// collaborator if `stop` is set once the cycle gate is acquired.
    pub async fn converge_unless_stopped(
        &self,
        stop: &watch::Receiver<bool>,
    ) -> Option<Result<ConvergeOutcome, ConvergeError>> {
        let _gate = self.cycle_gate.lock().await;
        if *stop.borrow() {
            debug!("stop requested before the cycle began; not converging");
            return None;
        }
        let result = self.converge_locked().await;
        self.phase.send_replace(ReconcilePhase::Idle);
        Some(result)
    }

    async fn converge_locked(&self) -> Result<ConvergeOutcome, ConvergeError> {
        self.phase.send_replace(ReconcilePhase::ComputingVerdict);
        let target = self.ledger.lock().await.current_verdict();

        if let Some(applied) = self.applied.read().await.as_ref()
            && applied.state == target
        {
            debug!(%target, "verdict matches applied state; skipping");
            return Ok(ConvergeOutcome::Skipped(applied.clone()));
        }

        self.phase.send_replace(ReconcilePhase::Provisioning);
        info!(%target, provisioner = self.provisioner.name(), "provisioning");
        let raw = self.provisioner.provision(target).await.map_err(|e| {
            ConvergeError::TerraformOperation {
                target,
                details: e.to_string(),
            }
        })?;
        let output = ProvisionOutput::from_terraform_json(&raw, target).map_err(|e| {
            ConvergeError::TerraformOperation {
                target,
                details: e.to_string(),
            }
        })?;

        self.phase.send_replace(ReconcilePhase::Configuring);
        info!(%target, configurator = self.configurator.name(), "configuring nodes");
        let primary = PrimaryNode::for_output(target, &output);
        self.configurator
            .configure(output)
            .await
            .map_err(|e| ConvergeError::Configure {
                target,
                details: e.to_string(),
            })?;

        self.phase.send_replace(ReconcilePhase::Verifying);
        let verified = self.configurator.verify(target).await.map_err(|e| {
            ConvergeError::Configure {
                target,
                details: format!("verify: {e}"),
            }
        })?;
        if !verified {
            warn!(%target, "cluster did not reach expected size");
            return Err(ConvergeError::ClusterSetup {
                target,
                details: "cluster member count does not match request".to_string(),
            });
        }

        // Only record the topology once it is verified so a failed cycle is retried.
        let applied = AppliedCluster {
            state: target,
            primary,
        };
        *self.applied.write().await = Some(applied.clone());
        info!(%target, primary = ?applied.primary, "cluster converged");
        Ok(ConvergeOutcome::Converged(applied))
    }
}
