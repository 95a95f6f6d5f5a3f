//! Resource fan-out: one node execution becomes N sub-executions.
//!
//! Incoming resource stacks (one per predecessor sub-execution) are split
//! into unfiltered resources and resources with filter stacks on the
//! connecting edge. Filtered resources expand into one clone per stack; the
//! sub-executions are the Cartesian product over all axes, pruned so a
//! combination never mixes two filter ids from the same provider.

use std::collections::{BTreeMap, HashMap, HashSet};

use sluice_workflow::{composite_filter_id, FilterStack, Resource};

/// The inputs of one sub-execution.
#[derive(Debug, Clone)]
pub(crate) struct SubExecutionInput {
  pub forward: Vec<Resource>,
  pub backward: Vec<Resource>,
  pub filter_id: String,
}

/// One resource stack advertised by a predecessor sub-execution.
pub(crate) struct ForwardStack {
  /// Name of the predecessor item the stack came from.
  pub predecessor: String,
  pub resources: Vec<Resource>,
}

enum Axis {
  /// Alternative unfiltered resource lists of one predecessor; one list per
  /// sub-execution of that predecessor.
  Unfiltered(Vec<Vec<Resource>>),
  /// Clones of one filtered resource, one per filter stack.
  Expanded(Vec<Resource>),
}

/// Computes the filter combinations for a node.
///
/// `filter_stacks_for(predecessor, label)` enumerates the stacks the
/// connecting edge defines for a resource label. Backward resources are
/// cloned per combination with the combination's filter id attached.
pub(crate) fn filter_combinations<F>(
  forward_stacks: Vec<ForwardStack>,
  backward: &[Resource],
  filter_stacks_for: F,
) -> Vec<SubExecutionInput>
where
  F: Fn(&str, &str) -> Vec<FilterStack>,
{
  let mut unfiltered_by_predecessor: BTreeMap<String, Vec<Vec<Resource>>> = BTreeMap::new();
  let mut expansions: Vec<Vec<Resource>> = Vec::new();
  for stack in forward_stacks {
    if stack.resources.is_empty() {
      continue;
    }
    let mut unfiltered = Vec::new();
    for resource in stack.resources {
      let stacks = filter_stacks_for(&stack.predecessor, &resource.label);
      if stacks.is_empty() {
        unfiltered.push(resource);
      } else {
        expansions.push(expand_resource(&resource, stacks));
      }
    }
    if !unfiltered.is_empty() {
      unfiltered_by_predecessor
        .entry(stack.predecessor.clone())
        .or_default()
        .push(unfiltered);
    }
  }

  let mut axes: Vec<Axis> = unfiltered_by_predecessor
    .into_values()
    .map(Axis::Unfiltered)
    .collect();
  axes.extend(expansions.into_iter().map(Axis::Expanded));

  let mut combinations = Vec::new();
  let mut choice = vec![0usize; axes.len()];
  'product: loop {
    let mut forward: Vec<Resource> = Vec::new();
    for (axis, &index) in axes.iter().zip(&choice) {
      match axis {
        Axis::Unfiltered(lists) => forward.extend(lists[index].iter().cloned()),
        Axis::Expanded(clones) => forward.push(clones[index].clone()),
      }
    }
    if has_resource_affinity(&forward) {
      let filter_id = composite_filter_id(forward.iter().map(Resource::filter_id));
      let backward = backward
        .iter()
        .map(|resource| {
          let mut clone = resource.clone();
          clone.metadata.filter_id = Some(filter_id.clone());
          clone
        })
        .collect();
      combinations.push(SubExecutionInput {
        forward,
        backward,
        filter_id,
      });
    }
    // Odometer-style advance through the cross product.
    for position in (0..axes.len()).rev() {
      let width = match &axes[position] {
        Axis::Unfiltered(lists) => lists.len(),
        Axis::Expanded(clones) => clones.len(),
      };
      choice[position] += 1;
      if choice[position] < width {
        continue 'product;
      }
      choice[position] = 0;
    }
    break;
  }
  combinations
}

/// Clones a resource once per filter stack, applying the stack to each clone.
fn expand_resource(resource: &Resource, stacks: Vec<FilterStack>) -> Vec<Resource> {
  stacks
    .into_iter()
    .map(|stack| resource.with_filter_stack(stack))
    .collect()
}

/// A combination is coherent only if all resources from one provider carry
/// the same filter id.
fn has_resource_affinity(resources: &[Resource]) -> bool {
  let mut ids_by_provider: HashMap<&str, HashSet<&str>> = HashMap::new();
  for resource in resources {
    ids_by_provider
      .entry(resource.provider.as_str())
      .or_default()
      .insert(resource.filter_id());
  }
  ids_by_provider.values().all(|ids| ids.len() <= 1)
}
