// src/pipeline.rs
//
// =============================================================================
// GRAPHLOOM: RESOURCE PIPELINE
// =============================================================================
//
// The fan-out machinery.
//
// Before each filtered forward run the engine must turn the inbound
// resources into concrete input tuples:
// 1. Pool resources by filter stack and merge pools whose stacks are
//    subsets of another pool's stack.
// 2. Distribute stackless resources into every remaining pool.
// 3. Expand filterable resources into one clone per filter stack.
// 4. Cross-product the expanded stacks into candidate input tuples.
// 5. Drop tuples that mix different filtered streams of one provider.
// 6. Derive the run's human readable filter id.

use crate::filter_config::FilterConfig;
use crate::resource::{MetadataPatch, Resource, ResourceKind};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};

// ============================================================================
// 1. POOLS
// ============================================================================

/// Resources sharing one filter stack.
#[derive(Debug, Default)]
pub struct ResourcePool {
    pub resources: Vec<Resource>,
    pub filter_stack: Vec<FilterConfig>,
}

/// Groups the flattened forward stacks by filter stack, preserving first
/// appearance order.
pub fn pool_by_filter_stack(forward_stacks: &[Vec<Resource>]) -> Vec<ResourcePool> {
    let mut pools: Vec<ResourcePool> = Vec::new();
    for stack in forward_stacks {
        for resource in stack {
            let filter_stack = resource.metadata.filter_stack.clone();
            match pools.iter_mut().find(|pool| pool.filter_stack == filter_stack) {
                Some(pool) => pool.resources.push(resource.clone()),
                None => pools.push(ResourcePool {
                    resources: vec![resource.clone()],
                    filter_stack,
                }),
            }
        }
    }
    pools
}

/// Merges pools whose (non-empty) stack is a subset of another pool's stack,
/// repeating until no merge applies.
pub fn merge_pools(mut pools: Vec<ResourcePool>) -> Vec<ResourcePool> {
    loop {
        let merged = find_and_merge_pool(&mut pools);
        match merged {
            Some(index) => {
                pools.remove(index);
            }
            None => return pools,
        }
    }
}

fn find_and_merge_pool(pools: &mut [ResourcePool]) -> Option<usize> {
    for i in 0..pools.len() {
        if pools[i].filter_stack.is_empty() {
            continue;
        }
        for j in 0..pools.len() {
            if i == j {
                continue;
            }
            let subset = pools[i]
                .filter_stack
                .iter()
                .all(|config| pools[j].filter_stack.contains(config));
            if subset {
                let moved = std::mem::take(&mut pools[i].resources);
                pools[j].resources.extend(moved);
                return Some(i);
            }
        }
    }
    None
}

/// Appends the resources of the first stackless pool to every other pool and
/// drops it. Only applies when another pool exists; with a single pool (or
/// no stackless pool) the input passes through unchanged.
pub fn distribute_stackless_resources(pools: Vec<ResourcePool>) -> Vec<ResourcePool> {
    let Some(stackless) = pools.iter().position(|pool| pool.filter_stack.is_empty()) else {
        return pools;
    };
    if pools.len() == 1 {
        return pools;
    }
    let mut pools = pools;
    let donor = pools.remove(stackless);
    for pool in &mut pools {
        pool.resources.extend(donor.resources.iter().cloned());
    }
    pools
}

/// The full pooling pass used by forward solids: pool, then (when more than
/// one pool emerged) merge and distribute.
pub fn assemble_forward_stacks(forward_stacks: &[Vec<Resource>]) -> Vec<Vec<Resource>> {
    let mut pools = pool_by_filter_stack(forward_stacks);
    if pools.len() > 1 {
        pools = merge_pools(pools);
        pools = distribute_stackless_resources(pools);
    }
    pools.into_iter().map(|pool| pool.resources).collect()
}

// ============================================================================
// 2. EXPANSION & CROSS-PRODUCT
// ============================================================================

/// Cross-product of per-filter-type config lists into filter stacks. With no
/// config lists at all the result is a single empty stack.
pub fn filter_stacks_product(config_lists: &[Vec<FilterConfig>]) -> Vec<Vec<FilterConfig>> {
    let mut stacks: Vec<Vec<FilterConfig>> = vec![Vec::new()];
    for configs in config_lists {
        if configs.is_empty() {
            continue;
        }
        let mut next = Vec::new();
        for stack in &stacks {
            for config in configs {
                let mut extended = stack.clone();
                extended.push(config.clone());
                next.push(extended);
            }
        }
        stacks = next;
    }
    stacks
}

/// Expands a resource into one clone per filter stack, each with the stack
/// recorded in metadata and appended to the URL.
pub fn expand_resource_stack(
    resource: &Resource,
    filter_stacks: &[Vec<FilterConfig>],
) -> Vec<Resource> {
    let mut expanded = Vec::new();
    for stack in filter_stacks {
        let mut clone = resource.clone_with(MetadataPatch {
            filter_stack: Some(stack.clone()),
            ..Default::default()
        });
        for config in stack {
            clone.apply_filter_config(config);
        }
        expanded.push(clone);
    }
    expanded
}

/// One axis of the input cross-product: the choices for one independent
/// input, each choice contributing one or more resources to the tuple.
pub type ProductAxis = Vec<Vec<Resource>>;

/// Cartesian product over the axes; each combination flattens its choices.
/// An axis without choices eliminates every combination.
pub fn cross_product(axes: &[ProductAxis]) -> Vec<Vec<Resource>> {
    let mut combinations: Vec<Vec<Resource>> = vec![Vec::new()];
    for axis in axes {
        let mut next = Vec::new();
        for combination in &combinations {
            for choice in axis {
                let mut extended = combination.clone();
                extended.extend(choice.iter().cloned());
                next.push(extended);
            }
        }
        combinations = next;
    }
    combinations
}

/// Rejects tuples in which two resources from the same provider carry
/// different filter ids: filtered streams from one producer must not cross.
pub fn check_resource_affinity(resources: &[Resource]) -> bool {
    let mut ids_by_provider: HashMap<&str, BTreeSet<Option<&str>>> = HashMap::new();
    for resource in resources {
        ids_by_provider
            .entry(resource.provider_name.as_str())
            .or_default()
            .insert(resource.metadata.filter_id.as_deref());
    }
    ids_by_provider.values().all(|ids| ids.len() == 1)
}

// ============================================================================
// 3. FILTER IDS
// ============================================================================

/// Named filters in a stack, in stack order.
pub fn filter_names_from_stack(stack: &[FilterConfig]) -> Vec<String> {
    stack.iter().filter_map(FilterConfig::name).collect()
}

/// Derives the filter id of one forward run from its input resources and
/// their stacks: database inputs contribute
/// `"<filter names comma-joined> - <provider>"`, everything else its own
/// inherited filter id. The parts are sorted and joined with `" & "`.
pub fn make_filter_id(resource_stacks: &[(Resource, Vec<FilterConfig>)]) -> String {
    let mut provider_filters = BTreeSet::new();
    for (resource, stack) in resource_stacks {
        if resource.kind != ResourceKind::Database {
            if let Some(filter_id) = &resource.metadata.filter_id {
                if !filter_id.is_empty() {
                    provider_filters.insert(filter_id.clone());
                }
            }
        } else {
            let mut names = filter_names_from_stack(stack);
            names.sort();
            if names.is_empty() {
                continue;
            }
            provider_filters.insert(format!("{} - {}", names.join(", "), resource.provider_name));
        }
    }
    provider_filters.into_iter().collect::<Vec<_>>().join(" & ")
}

/// Distinct scenario names selected across a set of filter stacks.
pub fn scenario_names_from_stacks<'a>(
    stacks: impl IntoIterator<Item = &'a Vec<FilterConfig>>,
) -> Vec<String> {
    let mut scenarios = BTreeSet::new();
    for stack in stacks {
        for config in stack {
            if let Some(name) = config.scenario_name() {
                scenarios.insert(name.to_string());
            }
        }
    }
    scenarios.into_iter().collect()
}

/// Short stable hash of a filter id, safe for directory names.
pub fn hash_filter_id(filter_id: &str) -> String {
    if filter_id.is_empty() {
        return String::new();
    }
    let mut hasher = Sha256::new();
    hasher.update(filter_id.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Deterministic grouping of unfiltered resource lists by provider, used to
/// build product axes in a stable order.
pub type UnfilteredLists = BTreeMap<String, Vec<Vec<Resource>>>;
