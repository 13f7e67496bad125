//! Differ - Compare desired state with persisted state to generate a Plan
//!
//! Compares the "desired state" declared in DSL with the records of
//! previously applied state, and generates the ordered list of Effects
//! needed to converge (Plan). Planning is pure: nothing is called.

use std::collections::{HashMap, HashSet};

use crate::dependency::{CyclicDependencyError, DependencyGraph, sort_resources};
use crate::effect::Effect;
use crate::plan::Plan;
use crate::resource::{ResolveError, Resource, ResourceId, State, Value};
use crate::schema::{ResourceSchema, SchemaRegistry};

/// Error raised while planning
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error(transparent)]
    Cycle(#[from] CyclicDependencyError),

    #[error("Cannot plan {id}: {source}")]
    Resolve {
        id: ResourceId,
        #[source]
        source: ResolveError,
    },
}

/// Arguments with references substituted; `None` means known only after apply
pub type ResolvedArguments = HashMap<String, Option<Value>>;

/// What planning knows about a resource handled earlier in the run
struct Planned<'a> {
    arguments: ResolvedArguments,
    state: Option<&'a State>,
    /// Created or replaced: computed attributes are unknown until apply
    recreating: bool,
    step: usize,
}

/// Compare a desired resource with its persisted record
pub fn diff(
    desired: &Resource,
    resolved: &ResolvedArguments,
    current: Option<&State>,
    schema: Option<&ResourceSchema>,
) -> Effect {
    let Some(current) = current.filter(|s| s.exists) else {
        return Effect::Create(desired.clone());
    };

    let changed = find_changed_attributes(resolved, &current.argument_hashes);
    let policy = schema.map(|s| s.replacement).unwrap_or_default();

    if current.tainted {
        return Effect::Replace {
            id: desired.id.clone(),
            from: current.clone(),
            to: desired.clone(),
            changed_attributes: changed,
            policy,
        };
    }

    if changed.is_empty() {
        return Effect::NoOp(desired.clone());
    }

    let forces_replacement = schema.is_some_and(|s| changed.iter().any(|a| s.is_force_new(a)));
    if forces_replacement {
        Effect::Replace {
            id: desired.id.clone(),
            from: current.clone(),
            to: desired.clone(),
            changed_attributes: changed,
            policy,
        }
    } else {
        Effect::Update {
            id: desired.id.clone(),
            from: current.clone(),
            to: desired.clone(),
            changed_attributes: changed,
        }
    }
}

/// Find changed attributes by comparing per-attribute hashes.
/// Unknown values always count as changed.
fn find_changed_attributes(
    resolved: &ResolvedArguments,
    recorded: &HashMap<String, String>,
) -> Vec<String> {
    let mut changed = Vec::new();

    for (key, value) in resolved {
        // Skip internal attributes (starting with _)
        if key.starts_with('_') {
            continue;
        }
        match value {
            Some(v) if recorded.get(key) == Some(&v.content_hash()) => {}
            _ => changed.push(key.clone()),
        }
    }

    // Arguments that were set before and are now removed
    for key in recorded.keys() {
        if !resolved.contains_key(key) {
            changed.push(key.clone());
        }
    }

    changed.sort();
    changed
}

fn resolve_arguments(
    resource: &Resource,
    planned: &HashMap<String, Planned<'_>>,
) -> Result<ResolvedArguments, PlanError> {
    let lookup = |binding: &str, attr: &str| -> Result<Option<Value>, ResolveError> {
        let Some(p) = planned.get(binding) else {
            return Err(ResolveError::Unresolved {
                binding: binding.to_string(),
                attribute: attr.to_string(),
            });
        };
        if let Some(argument) = p.arguments.get(attr) {
            return Ok(argument.clone());
        }
        if p.recreating {
            return Ok(None);
        }
        Ok(p.state.and_then(|s| s.attributes.get(attr)).cloned())
    };

    resource
        .attributes
        .iter()
        .map(|(key, value)| {
            let resolved = value
                .resolve(&lookup)
                .map_err(|source| PlanError::Resolve {
                    id: resource.id.clone(),
                    source,
                })?;
            Ok((key.clone(), resolved))
        })
        .collect()
}

/// Compute Effects for every desired resource and every orphaned record
pub fn create_plan(
    desired: &[Resource],
    current_states: &HashMap<ResourceId, State>,
    schemas: &SchemaRegistry,
) -> Result<Plan, PlanError> {
    let sorted = sort_resources(desired.to_vec())?;
    let mut plan = Plan::new();
    let mut planned: HashMap<String, Planned<'_>> = HashMap::new();
    let mut step_of: HashMap<ResourceId, usize> = HashMap::new();

    for resource in &sorted {
        let state = current_states.get(&resource.id).filter(|s| s.exists);
        let resolved = resolve_arguments(resource, &planned)?;
        let effect = diff(
            resource,
            &resolved,
            state,
            schemas.get(&resource.id.resource_type),
        );
        let recreating = matches!(effect, Effect::Create(_) | Effect::Replace { .. });

        let mut after: Vec<usize> = resource
            .dependency_bindings()
            .iter()
            .filter_map(|binding| planned.get(binding).map(|p| p.step))
            .collect();

        // A deposed object goes first: the step below may record a new one
        if let Some(state) = state.filter(|s| s.deposed.is_some()) {
            after.push(plan.add(
                Effect::Delete {
                    id: resource.id.clone(),
                    from: state.clone(),
                    deposed: true,
                },
                vec![],
            ));
        }
        log::debug!("{}: {}", resource.id, effect.kind());
        let step = plan.add(effect, after);

        step_of.insert(resource.id.clone(), step);
        planned.insert(
            resource.binding().to_string(),
            Planned {
                arguments: resolved,
                state,
                recreating,
                step,
            },
        );
    }

    // Records that are no longer declared, dependents first
    let desired_ids: HashSet<&ResourceId> = sorted.iter().map(|r| &r.id).collect();
    let state_graph = DependencyGraph::from_states(current_states.values());
    let mut delete_step: HashMap<ResourceId, usize> = HashMap::new();

    for id in state_graph.reverse_topological_order()? {
        let Some(state) = current_states.get(&id) else {
            continue;
        };
        if desired_ids.contains(&id) {
            continue;
        }
        let mut after: Vec<usize> = state_graph
            .dependents_of(&id)
            .filter_map(|dependent| {
                delete_step
                    .get(dependent)
                    .or_else(|| step_of.get(dependent))
                    .copied()
            })
            .collect();
        if state.deposed.is_some() {
            after.push(plan.add(
                Effect::Delete {
                    id: id.clone(),
                    from: state.clone(),
                    deposed: true,
                },
                vec![],
            ));
        }
        log::debug!("{}: delete (no longer declared)", id);
        let step = plan.add(
            Effect::Delete {
                id: id.clone(),
                from: state.clone(),
                deposed: false,
            },
            after,
        );
        delete_step.insert(id, step);
    }

    Ok(plan)
}

/// Plan the deletion of every persisted record
pub fn destroy_plan(current_states: &HashMap<ResourceId, State>) -> Result<Plan, PlanError> {
    create_plan(&[], current_states, &SchemaRegistry::new())
}
