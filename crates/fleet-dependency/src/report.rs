//! ---
//! fleet_section: "02-dependency-engine"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Dependency engine orchestrating manifold workers."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifecycle state of a single node.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Stopped,
    Starting,
    Started,
    Stopping,
    /// Fatal failure or abandoned stop; see `last_error`.
    Error,
}

impl NodeState {
    pub const ALL: [NodeState; 5] = [
        NodeState::Stopped,
        NodeState::Starting,
        NodeState::Started,
        NodeState::Stopping,
        NodeState::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Stopped => "stopped",
            NodeState::Starting => "starting",
            NodeState::Started => "started",
            NodeState::Stopping => "stopping",
            NodeState::Error => "error",
        }
    }

    /// Whether a worker or start attempt may still be live.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            NodeState::Starting | NodeState::Started | NodeState::Stopping
        )
    }
}

/// Lifecycle of the engine as a whole.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Running,
    Stopping,
    Stopped,
}

/// Diagnostic snapshot of one node.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NodeReport {
    pub name: String,
    pub state: NodeState,
    pub inputs: Vec<String>,
    pub last_error: Option<String>,
    /// Consecutive ordinary failures; reset by a successful start.
    pub error_count: u32,
    pub start_count: u64,
    pub started_at: Option<DateTime<Utc>>,
    /// Permanently removed after returning the uninstall signal.
    pub uninstalled: bool,
    pub outputs: Vec<&'static str>,
}

/// Diagnostic snapshot of the whole engine.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EngineReport {
    pub state: EngineState,
    /// Nodes in registration order.
    pub nodes: Vec<NodeReport>,
    /// Workers that failed to stop within the stop timeout.
    pub faults: Vec<String>,
}

impl EngineReport {
    pub fn node(&self, name: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|node| node.name == name)
    }

    pub fn state_of(&self, name: &str) -> Option<NodeState> {
        self.node(name).map(|node| node.state)
    }

    /// Names of nodes currently in `state`.
    pub fn in_state(&self, state: NodeState) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|node| node.state == state)
            .map(|node| node.name.as_str())
            .collect()
    }

    pub fn count(&self, state: NodeState) -> usize {
        self.nodes.iter().filter(|node| node.state == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialises_states_in_lowercase() {
        let report = EngineReport {
            state: EngineState::Running,
            nodes: vec![NodeReport {
                name: "agent".into(),
                state: NodeState::Started,
                inputs: Vec::new(),
                last_error: None,
                error_count: 0,
                start_count: 1,
                started_at: None,
                uninstalled: false,
                outputs: vec!["bool"],
            }],
            faults: Vec::new(),
        };
        let json = serde_json::to_value(&report).expect("serialises");
        assert_eq!(json["state"], "running");
        assert_eq!(json["nodes"][0]["state"], "started");
        assert_eq!(report.in_state(NodeState::Started), vec!["agent"]);
        assert_eq!(report.count(NodeState::Error), 0);
    }
}
