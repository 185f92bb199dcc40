//! Collaborative state machine classes.
//!
//! A collaborative state machine is a set of state machine classes connected
//! by a routing graph: an edge `source -> target` exists for every event the
//! source may raise that the target handles, subject to the event channel.

use super::builder::{declarations, StateMachineClassBuilder};
use super::machine::StateMachineClass;
use crate::context::ContextVariable;
use crate::description::{CollaborativeStateMachineDescription, StateMachineDescription};
use crate::error::CoreError;
use crate::event::EventChannel;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// An edge of the routing graph, between vertex indices.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingEdge {
    pub source: usize,
    pub target: usize,
    pub event: String,
    pub channel: EventChannel,
}

/// An immutable collaborative state machine class.
#[derive(Debug, Clone)]
pub struct CollaborativeStateMachineClass {
    name: String,
    version: String,
    state_machines: Vec<Arc<StateMachineClass>>,
    vertices: Vec<Arc<StateMachineClass>>,
    edges: Vec<RoutingEdge>,
    local_context: Vec<ContextVariable>,
    persistent_context: Vec<ContextVariable>,
}

impl CollaborativeStateMachineClass {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Top-level state machine classes in declaration order.
    pub fn state_machines(&self) -> &[Arc<StateMachineClass>] {
        &self.state_machines
    }

    /// All vertices of the routing graph, nested machines included.
    pub fn vertices(&self) -> &[Arc<StateMachineClass>] {
        &self.vertices
    }

    pub fn edges(&self) -> &[RoutingEdge] {
        &self.edges
    }

    /// Edges leaving the vertex with the given index.
    pub fn edges_from(&self, source: usize) -> impl Iterator<Item = &RoutingEdge> {
        self.edges.iter().filter(move |edge| edge.source == source)
    }

    pub fn vertex_index(&self, name: &str) -> Option<usize> {
        self.vertices.iter().position(|vertex| vertex.name() == name)
    }

    /// Finds a top-level state machine class by name.
    pub fn find_state_machine_class_by_name(&self, name: &str) -> Option<&Arc<StateMachineClass>> {
        self.state_machines
            .iter()
            .find(|machine| machine.name() == name)
    }

    pub fn local_context(&self) -> &[ContextVariable] {
        &self.local_context
    }

    /// Persistent declarations of the collaborative machine and its classes.
    pub fn persistent_context(&self) -> &[ContextVariable] {
        &self.persistent_context
    }
}

/// Builds a [`CollaborativeStateMachineClass`] from its description.
pub struct CollaborativeStateMachineClassBuilder<'a> {
    description: &'a CollaborativeStateMachineDescription,
}

impl<'a> CollaborativeStateMachineClassBuilder<'a> {
    pub fn new(description: &'a CollaborativeStateMachineDescription) -> Self {
        Self { description }
    }

    pub fn build(&self) -> Result<CollaborativeStateMachineClass, CoreError> {
        let descriptions = self.index_descriptions()?;

        let mut built: HashMap<String, Arc<StateMachineClass>> = HashMap::new();
        let mut visiting = Vec::new();
        for machine in &self.description.state_machines {
            resolve(&machine.name, &descriptions, &mut built, &mut visiting)?;
        }

        let state_machines: Vec<Arc<StateMachineClass>> = self
            .description
            .state_machines
            .iter()
            .filter_map(|machine| built.get(&machine.name).cloned())
            .collect();

        let mut vertices = Vec::new();
        for machine in &state_machines {
            collect_vertices(machine, &mut vertices);
        }
        let edges = route(&vertices);

        let mut persistent_context = declarations(&self.description.persistent_context);
        for vertex in &vertices {
            for variable in vertex.persistent_context() {
                if !persistent_context
                    .iter()
                    .any(|existing| existing.name() == variable.name())
                {
                    persistent_context.push(variable.clone());
                }
            }
        }

        tracing::debug!(
            "Built collaborative state machine '{}' with {} vertices and {} edges",
            self.description.name,
            vertices.len(),
            edges.len()
        );

        Ok(CollaborativeStateMachineClass {
            name: self.description.name.clone(),
            version: self.description.version.clone(),
            state_machines,
            vertices,
            edges,
            local_context: declarations(&self.description.local_context),
            persistent_context,
        })
    }

    fn index_descriptions(
        &self,
    ) -> Result<HashMap<&'a str, &'a StateMachineDescription>, CoreError> {
        let mut index = HashMap::new();
        for machine in &self.description.state_machines {
            if index.insert(machine.name.as_str(), machine).is_some() {
                return Err(CoreError::DuplicateName {
                    machine: self.description.name.clone(),
                    kind: "state machine",
                    name: machine.name.clone(),
                });
            }
        }
        Ok(index)
    }
}

/// Builds `name` after its bases, memoizing results in `built`.
fn resolve(
    name: &str,
    descriptions: &HashMap<&str, &StateMachineDescription>,
    built: &mut HashMap<String, Arc<StateMachineClass>>,
    visiting: &mut Vec<String>,
) -> Result<(), CoreError> {
    if built.contains_key(name) {
        return Ok(());
    }
    if visiting.iter().any(|entry| entry == name) {
        return Err(CoreError::InheritanceCycle {
            machine: name.to_string(),
        });
    }
    let Some(description) = descriptions.get(name).copied() else {
        // Reported by the builder of the extending machine
        return Ok(());
    };

    visiting.push(name.to_string());
    let mut bases = Vec::new();
    collect_bases(description, &mut bases);
    for base in bases {
        resolve(base, descriptions, built, visiting)?;
    }
    visiting.pop();

    let class = StateMachineClassBuilder::new(description, built).build()?;
    built.insert(name.to_string(), Arc::new(class));
    Ok(())
}

/// Bases extended by a machine or any of its nested machines.
fn collect_bases<'d>(description: &'d StateMachineDescription, out: &mut Vec<&'d str>) {
    if let Some(base) = &description.extends {
        out.push(base);
    }
    for nested in &description.machines {
        collect_bases(nested, out);
    }
}

fn collect_vertices(machine: &Arc<StateMachineClass>, out: &mut Vec<Arc<StateMachineClass>>) {
    out.push(machine.clone());
    for nested in machine.nested() {
        collect_vertices(nested, out);
    }
}

fn route(vertices: &[Arc<StateMachineClass>]) -> Vec<RoutingEdge> {
    let inputs: Vec<_> = vertices.iter().map(|vertex| vertex.input_events()).collect();
    let mut seen = HashSet::new();
    let mut edges = Vec::new();

    for (source, vertex) in vertices.iter().enumerate() {
        for (event, channel) in vertex.output_events() {
            for (target, handled) in inputs.iter().enumerate() {
                let reachable = match channel {
                    EventChannel::Internal => source == target,
                    EventChannel::External | EventChannel::Global => true,
                };
                if !reachable || !handled.contains(&event) {
                    continue;
                }
                let edge = RoutingEdge {
                    source,
                    target,
                    event: event.clone(),
                    channel,
                };
                if seen.insert(edge.clone()) {
                    edges.push(edge);
                }
            }
        }
    }

    edges
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn describe(value: serde_json::Value) -> CollaborativeStateMachineDescription {
        serde_json::from_value(value).unwrap()
    }

    fn inheritance() -> CollaborativeStateMachineDescription {
        describe(json!({
            "name": "inheritance",
            "state_machines": [
                {"name": "stateMachine2", "extends": "stateMachine1",
                 "states": [{"name": "state2"}]},
                {"name": "stateMachine1", "abstract": true,
                 "states": [{"name": "state1", "initial": true, "on": [{"event": "e1", "target": "state2"}]},
                            {"name": "state2", "abstract": true}]}
            ]
        }))
    }

    #[test]
    fn test_bases_built_before_derived() {
        let csm = CollaborativeStateMachineClassBuilder::new(&inheritance())
            .build()
            .unwrap();
        assert_eq!(csm.vertices().len(), 2);
        let derived = csm.find_state_machine_class_by_name("stateMachine2").unwrap();
        assert_eq!(derived.base_name(), Some("stateMachine1"));
        assert!(!derived.is_abstract());
        assert_eq!(derived.state_count(), 2);
    }

    #[test]
    fn test_inheritance_cycle() {
        let description = describe(json!({
            "name": "cycle",
            "state_machines": [
                {"name": "a", "extends": "b", "states": [{"name": "s", "initial": true}]},
                {"name": "b", "extends": "a", "states": [{"name": "s", "initial": true}]}
            ]
        }));
        assert!(matches!(
            CollaborativeStateMachineClassBuilder::new(&description).build(),
            Err(CoreError::InheritanceCycle { .. })
        ));
    }

    #[test]
    fn test_missing_base() {
        let description = describe(json!({
            "name": "missing",
            "state_machines": [
                {"name": "a", "extends": "nope", "states": [{"name": "s", "initial": true}]}
            ]
        }));
        assert!(matches!(
            CollaborativeStateMachineClassBuilder::new(&description).build(),
            Err(CoreError::InvalidBase { .. })
        ));
    }

    #[test]
    fn test_duplicate_machine_names() {
        let description = describe(json!({
            "name": "dup",
            "state_machines": [
                {"name": "a", "states": [{"name": "s", "initial": true}]},
                {"name": "a", "states": [{"name": "s", "initial": true}]}
            ]
        }));
        assert!(matches!(
            CollaborativeStateMachineClassBuilder::new(&description).build(),
            Err(CoreError::DuplicateName { .. })
        ));
    }

    #[test]
    fn test_routing_edges() {
        let description = describe(json!({
            "name": "routing",
            "state_machines": [
                {"name": "ping", "states": [
                    {"name": "a", "initial": true,
                     "entry": [{"type": "raise", "event": {"name": "ping", "channel": "global"}},
                               {"type": "raise", "event": {"name": "self", "channel": "internal"}}],
                     "on": [{"event": "pong", "target": "a"}, {"event": "self", "target": "a"}]}]},
                {"name": "pong", "states": [
                    {"name": "a", "initial": true,
                     "entry": [{"type": "raise", "event": {"name": "pong", "channel": "external"}}],
                     "on": [{"event": "ping", "target": "a"}, {"event": "self", "target": "a"}]}]}
            ]
        }));
        let csm = CollaborativeStateMachineClassBuilder::new(&description)
            .build()
            .unwrap();

        let ping = csm.vertex_index("ping").unwrap();
        let pong = csm.vertex_index("pong").unwrap();
        let edges: HashSet<_> = csm
            .edges()
            .iter()
            .map(|edge| (edge.source, edge.target, edge.event.as_str()))
            .collect();

        assert!(edges.contains(&(ping, pong, "ping")));
        assert!(edges.contains(&(pong, ping, "pong")));
        assert!(edges.contains(&(ping, ping, "self")));
        // internal events never leave the raising machine
        assert!(!edges.contains(&(ping, pong, "self")));
        assert_eq!(edges.len(), 3);
        assert_eq!(csm.edges_from(ping).count(), 2);
    }

    #[test]
    fn test_nested_machines_are_vertices() {
        let description = describe(json!({
            "name": "nested",
            "persistent_context": {"variables": [{"name": "p", "value": "0"}]},
            "state_machines": [
                {"name": "outer",
                 "persistent_context": {"variables": [{"name": "q", "value": "1"}, {"name": "p", "value": "5"}]},
                 "states": [{"name": "a", "initial": true, "on": [{"event": "done", "target": "a"}]}],
                 "machines": [{"name": "inner", "states": [
                     {"name": "x", "initial": true, "terminal": true,
                      "entry": [{"type": "raise", "event": {"name": "done", "channel": "global"}}]}]}]}
            ]
        }));
        let csm = CollaborativeStateMachineClassBuilder::new(&description)
            .build()
            .unwrap();

        assert_eq!(csm.state_machines().len(), 1);
        assert_eq!(csm.vertices().len(), 2);
        let inner = csm.vertex_index("inner").unwrap();
        let outer = csm.vertex_index("outer").unwrap();
        assert_eq!(csm.edges()[0].source, inner);
        assert_eq!(csm.edges()[0].target, outer);

        let names: Vec<_> = csm.persistent_context().iter().map(|v| v.name()).collect();
        assert_eq!(names, vec!["p", "q"]);
    }
}
