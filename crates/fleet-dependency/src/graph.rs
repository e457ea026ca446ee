//! ---
//! fleet_section: "02-dependency-engine"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Dependency engine orchestrating manifold workers."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::collections::HashMap;

use indexmap::IndexMap;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::ConfigError;
use crate::manifold::Manifold;

/// Structural checks applied when a manifold joins the graph.
pub(crate) fn check_new(
    manifolds: &IndexMap<String, Manifold>,
    manifold: &Manifold,
) -> Result<(), ConfigError> {
    let name = manifold.name();
    if name.is_empty() {
        return Err(ConfigError::EmptyName);
    }
    if manifolds.contains_key(name) {
        return Err(ConfigError::Duplicate(name.to_owned()));
    }
    let mut seen = Vec::with_capacity(manifold.inputs().len());
    for input in manifold.inputs() {
        if input == name {
            return Err(ConfigError::SelfInput(name.to_owned()));
        }
        if seen.contains(&input) {
            return Err(ConfigError::DuplicateInput {
                name: name.to_owned(),
                input: input.clone(),
            });
        }
        seen.push(input);
    }
    Ok(())
}

/// Members of the first dependency cycle, in registration order.
///
/// Inputs naming manifolds that are not registered yet are ignored, so this
/// can run on a partially built graph.
pub(crate) fn find_cycle(manifolds: &IndexMap<String, Manifold>) -> Option<Vec<String>> {
    let mut graph = DiGraph::<&str, ()>::with_capacity(manifolds.len(), 0);
    let indices: HashMap<&str, NodeIndex> = manifolds
        .keys()
        .map(|name| (name.as_str(), graph.add_node(name.as_str())))
        .collect();
    for (name, manifold) in manifolds {
        for input in manifold.inputs() {
            if let Some(&from) = indices.get(input.as_str()) {
                graph.add_edge(from, indices[name.as_str()], ());
            }
        }
    }

    tarjan_scc(&graph)
        .into_iter()
        .find(|component| component.len() > 1)
        .map(|component| {
            let mut members: Vec<_> = component.iter().map(|idx| graph[*idx]).collect();
            members.sort_by_key(|member| manifolds.get_index_of(*member));
            members.into_iter().map(str::to_owned).collect()
        })
}

/// Inputs that name manifolds absent from the graph.
pub(crate) fn check_complete(manifolds: &IndexMap<String, Manifold>) -> Result<(), ConfigError> {
    for (name, manifold) in manifolds {
        if let Some(input) = manifold
            .inputs()
            .iter()
            .find(|input| !manifolds.contains_key(input.as_str()))
        {
            return Err(ConfigError::UnknownInput {
                name: name.clone(),
                input: input.clone(),
            });
        }
    }
    Ok(())
}

/// Direct dependents of every manifold, in registration order.
pub(crate) fn dependents(manifolds: &IndexMap<String, Manifold>) -> HashMap<String, Vec<String>> {
    let mut dependents: HashMap<String, Vec<String>> = manifolds
        .keys()
        .map(|name| (name.clone(), Vec::new()))
        .collect();
    for (name, manifold) in manifolds {
        for input in manifold.inputs() {
            if let Some(list) = dependents.get_mut(input) {
                list.push(name.clone());
            }
        }
    }
    dependents
}
