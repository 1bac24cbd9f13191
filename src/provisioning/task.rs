//! `ProvisioningTask` and the manifest types `Planner` consumes (§3, §4.4).

use crate::types::ClusterId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Infrastructure,
    Applications,
    Interfaces,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningTask {
    pub name: String,
    pub role: String,
    pub host: String,
    pub cluster: Option<ClusterId>,
    pub phase: Phase,
    pub idempotent: bool,
}

impl ProvisioningTask {
    pub fn new(name: impl Into<String>, role: impl Into<String>, host: impl Into<String>, phase: Phase) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            host: host.into(),
            cluster: None,
            phase,
            // All provisioning tasks are idempotent so a replayed plan is a
            // no-op (§8 round-trip property).
            idempotent: true,
        }
    }

    pub fn with_cluster(mut self, cluster: ClusterId) -> Self {
        self.cluster = Some(cluster);
        self
    }
}

/// One infrastructure node (Zookeeper ensemble member, Kafka broker, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfraSpec {
    pub name: String,
    pub kind: InfraKind,
    pub host: String,
    pub cluster: Option<ClusterId>,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InfraKind {
    Zookeeper,
    Kafka,
    Other(String),
}

/// An application service entry in the manifest. `deploy_type` selects
/// which of the two distinguished roles (`quartermaster`, `privateer`) or
/// the generic `service` role this task plays; anything else fails the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSpec {
    pub name: String,
    pub deploy_type: String,
    pub host: String,
    pub cluster: Option<ClusterId>,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSpec {
    pub name: String,
    pub host: String,
    pub cluster: Option<ClusterId>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub infrastructure: Vec<InfraSpec>,
    #[serde(default)]
    pub applications: Vec<AppSpec>,
    #[serde(default)]
    pub interfaces: Vec<InterfaceSpec>,
}

pub const QUARTERMASTER: &str = "quartermaster";
pub const PRIVATEER: &str = "privateer";
pub const KNOWN_DEPLOY_TYPES: &[&str] = &[QUARTERMASTER, PRIVATEER, "service"];
