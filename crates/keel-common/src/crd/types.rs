//! Shared status types: conditions, addresses and lifecycle phases

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Typed, timestamped record of one sub-outcome of provisioning
///
/// A status holds at most one Condition per `type_`; use [`set_condition`]
/// rather than pushing onto the list directly.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., EnsureSystemPrep)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Last time the condition was probed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_time: Option<DateTime<Utc>>,

    /// Last time the condition transitioned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,
}

impl Condition {
    /// Create a condition probed now
    ///
    /// The transition time is left unset so [`set_condition`] keeps the time
    /// already recorded for this type.
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            last_probe_time: Some(Utc::now()),
            last_transition_time: None,
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a successful condition
    pub fn success(type_: impl Into<String>) -> Self {
        Self::new(type_, ConditionStatus::True, "", "")
    }

    /// Shorthand for a failed condition
    pub fn failure(
        type_: impl Into<String>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(type_, ConditionStatus::False, reason, message)
    }

    /// Explicitly set the transition time
    pub fn with_transition_time(mut self, at: DateTime<Utc>) -> Self {
        self.last_transition_time = Some(at);
        self
    }

    /// True when status is `True`
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }

    /// True when status is `False`
    pub fn is_false(&self) -> bool {
        self.status == ConditionStatus::False
    }
}

/// Insert or replace a condition keyed by its type
///
/// A matching entry is replaced in place and keeps its original transition
/// time unless the incoming one is explicitly newer. A new type is appended.
/// Relative order of all other entries is preserved.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        condition.last_transition_time = match (
            existing.last_transition_time,
            condition.last_transition_time,
        ) {
            (Some(old), Some(new)) if new > old => Some(new),
            (Some(old), _) => Some(old),
            (None, Some(new)) => Some(new),
            (None, None) => Some(Utc::now()),
        };
        *existing = condition;
        return;
    }

    if condition.last_transition_time.is_none() {
        condition.last_transition_time = Some(Utc::now());
    }
    conditions.push(condition);
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Kind of reachable address
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum AddressType {
    /// Externally reachable address
    Public,
    /// Address advertised by the API server (VIP)
    Advertise,
    /// Real address of a control-plane node
    Real,
    /// Cluster-internal address
    Internal,
    /// Support/management address
    Support,
}

impl std::fmt::Display for AddressType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Public => "Public",
            Self::Advertise => "Advertise",
            Self::Real => "Real",
            Self::Internal => "Internal",
            Self::Support => "Support",
        };
        f.write_str(s)
    }
}

/// A reachable endpoint of a cluster or machine
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    /// Address kind
    #[serde(rename = "type")]
    pub type_: AddressType,
    /// Host name or IP
    pub host: String,
    /// Port
    pub port: i32,
}

impl Address {
    /// Create an address
    pub fn new(type_: AddressType, host: impl Into<String>, port: i32) -> Self {
        Self {
            type_,
            host: host.into(),
            port,
        }
    }
}

/// Add an address unless the identical tuple is already present
pub fn add_address(addresses: &mut Vec<Address>, address: Address) {
    if !addresses.contains(&address) {
        addresses.push(address);
    }
}

/// Remove every address of the given type
pub fn remove_addresses(addresses: &mut Vec<Address>, type_: AddressType) {
    addresses.retain(|a| a.type_ != type_);
}

/// Pick the address to reach a cluster's API server
///
/// Preference is Internal, then Advertise, then Real.
pub fn select_host(addresses: &[Address]) -> Result<&Address, Error> {
    [AddressType::Internal, AddressType::Advertise, AddressType::Real]
        .iter()
        .find_map(|t| addresses.iter().find(|a| a.type_ == *t))
        .ok_or_else(|| Error::validation("no valid address"))
}

/// Cluster lifecycle phase
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterPhase {
    /// Control plane is being provisioned
    Initializing,
    /// Control plane is up and being kept in sync
    Running,
    /// Provisioning failed unrecoverably
    Failed,
    /// Deletion requested, cleanup in progress
    Terminating,
    /// Requested Kubernetes version is not supported by this controller
    NotSupport,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "Initializing",
            Self::Running => "Running",
            Self::Failed => "Failed",
            Self::Terminating => "Terminating",
            Self::NotSupport => "NotSupport",
        };
        f.write_str(s)
    }
}

/// Machine lifecycle phase
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MachinePhase {
    /// Node is being provisioned and joined
    Initializing,
    /// Node has joined the cluster
    Running,
    /// Provisioning failed unrecoverably
    Failed,
    /// Node is being removed
    Terminating,
}

impl std::fmt::Display for MachinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "Initializing",
            Self::Running => "Running",
            Self::Failed => "Failed",
            Self::Terminating => "Terminating",
        };
        f.write_str(s)
    }
}

/// Taint applied to a node at join time
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeTaint {
    /// Taint key
    pub key: String,
    /// Taint value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// NoSchedule, PreferNoSchedule or NoExecute
    pub effect: String,
}

/// Connection details for one node
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineAccess {
    /// Node IP address
    pub ip: String,
    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// SSH user
    #[serde(default = "default_username")]
    pub username: String,
    /// SSH password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// PEM encoded private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    /// Passphrase for the private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

fn default_ssh_port() -> u16 {
    crate::DEFAULT_SSH_PORT
}

fn default_username() -> String {
    "root".to_string()
}

impl MachineAccess {
    /// Check that the descriptor can open a session
    pub fn validate(&self) -> Result<(), String> {
        if self.ip.is_empty() {
            return Err("ip cannot be empty".to_string());
        }
        if self.password.is_none() && self.private_key.is_none() {
            return Err(format!("machine {} has neither password nor privateKey", self.ip));
        }
        Ok(())
    }
}
