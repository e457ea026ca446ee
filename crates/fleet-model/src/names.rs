//! ---
//! fleet_section: "05-model-topology"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Manifold tables for the model agent topologies."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Manifold names shared by both topologies.

pub const AGENT: &str = "agent";
pub const API_CALLER: &str = "api-caller";
pub const API_CONFIG_WATCHER: &str = "api-config-watcher";
pub const CLOCK: &str = "clock";

pub const IS_RESPONSIBLE_FLAG: &str = "is-responsible-flag";
pub const NOT_ALIVE_FLAG: &str = "not-alive-flag";
pub const NOT_DEAD_FLAG: &str = "not-dead-flag";
pub const VALID_CREDENTIAL_FLAG: &str = "valid-credential-flag";

pub const MODEL_UPGRADE_GATE: &str = "model-upgrade-gate";
pub const MODEL_UPGRADED_FLAG: &str = "model-upgraded-flag";
pub const MODEL_UPGRADER: &str = "model-upgrader";

pub const MIGRATION_FORTRESS: &str = "migration-fortress";
pub const MIGRATION_INACTIVE_FLAG: &str = "migration-inactive-flag";
pub const MIGRATION_MASTER: &str = "migration-master";

pub const ENVIRON_TRACKER: &str = "environ-tracker";
pub const CAAS_BROKER_TRACKER: &str = "caas-broker-tracker";

pub const ACTION_PRUNER: &str = "action-pruner";
pub const APPLICATION_SCALER: &str = "application-scaler";
pub const CHARM_REVISION_UPDATER: &str = "charm-revision-updater";
pub const COMPUTE_PROVISIONER: &str = "compute-provisioner";
pub const FIREWALLER: &str = "firewaller";
pub const INSTANCE_POLLER: &str = "instance-poller";
pub const LOG_FORWARDER: &str = "log-forwarder";
pub const MACHINE_UNDERTAKER: &str = "machine-undertaker";
pub const METRIC_WORKER: &str = "metric-worker";
pub const REMOTE_RELATIONS: &str = "remote-relations";
pub const STATE_CLEANER: &str = "state-cleaner";
pub const STATUS_HISTORY_PRUNER: &str = "status-history-pruner";
pub const STORAGE_PROVISIONER: &str = "storage-provisioner";
pub const UNDERTAKER: &str = "undertaker";
pub const UNIT_ASSIGNER: &str = "unit-assigner";

pub const CAAS_FIREWALLER: &str = "caas-firewaller";
pub const CAAS_OPERATOR_PROVISIONER: &str = "caas-operator-provisioner";
pub const CAAS_UNIT_PROVISIONER: &str = "caas-unit-provisioner";
