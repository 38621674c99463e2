// Unit tests for the filter fan-out machinery: pooling, subset merging,
// stackless distribution, expansion, cross-products and filter ids.

use graphloom::filter_config::{filter_configs_from_url, FilterConfig};
use graphloom::pipeline::{
    assemble_forward_stacks, check_resource_affinity, cross_product, expand_resource_stack,
    filter_stacks_product, hash_filter_id, make_filter_id, scenario_names_from_stacks,
};
use graphloom::resource::{database_resource, file_resource, MetadataPatch, Resource};

fn filtered(resource: &Resource, stack: Vec<FilterConfig>) -> Resource {
    resource.clone_with(MetadataPatch {
        filter_stack: Some(stack),
        ..Default::default()
    })
}

fn tagged(resource: &Resource, filter_id: &str) -> Resource {
    resource.clone_with(MetadataPatch {
        filter_id: Some(filter_id.to_string()),
        ..Default::default()
    })
}

#[test]
fn pools_group_and_merge_by_subset() {
    let db = database_resource("a", "mysql://host/db", None, true, None);
    let s1 = FilterConfig::scenario("S1");
    let s2 = FilterConfig::scenario("S2");
    // One stack with [S1], one with [S1, S2]: the former is a subset and
    // merges into the latter.
    let stacks = vec![
        vec![filtered(&db, vec![s1.clone()])],
        vec![filtered(&db, vec![s1.clone(), s2.clone()])],
    ];
    let pooled = assemble_forward_stacks(&stacks);
    assert_eq!(pooled.len(), 1);
    assert_eq!(pooled[0].len(), 2);
}

#[test]
fn stackless_resources_join_every_pool() {
    let db = database_resource("a", "mysql://host/db", None, true, None);
    let plain = file_resource("b", "/data/b.out", None);
    let s1 = FilterConfig::scenario("S1");
    let s2 = FilterConfig::scenario("S2");
    let stacks = vec![
        vec![filtered(&db, vec![s1.clone()])],
        vec![filtered(&db, vec![s2.clone()])],
        vec![plain.clone()],
    ];
    let pooled = assemble_forward_stacks(&stacks);
    assert_eq!(pooled.len(), 2);
    for pool in &pooled {
        assert_eq!(pool.len(), 2, "each pool keeps its own plus the stackless");
    }
}

#[test]
fn a_sole_stackless_pool_passes_through() {
    let plain = file_resource("b", "/data/b.out", None);
    let stacks = vec![vec![plain.clone(), plain.clone()]];
    let pooled = assemble_forward_stacks(&stacks);
    assert_eq!(pooled.len(), 1);
    assert_eq!(pooled[0].len(), 2);
}

#[test]
fn filter_stacks_cross_product_covers_all_types() {
    let scenarios = vec![
        FilterConfig::scenario("S1"),
        FilterConfig::scenario("S2"),
    ];
    let alternatives = vec![FilterConfig::alternatives(vec!["alt1".to_string()])];
    let stacks = filter_stacks_product(&[scenarios, alternatives]);
    assert_eq!(stacks.len(), 2);
    for stack in &stacks {
        assert_eq!(stack.len(), 2);
    }
    // No config lists at all yields a single empty stack.
    assert_eq!(filter_stacks_product(&[]), vec![Vec::new()]);
}

#[test]
fn expansion_applies_stacks_to_metadata_and_url() {
    let db = database_resource("a", "mysql://host/db", None, true, None);
    let stacks = vec![
        vec![FilterConfig::scenario("S1")],
        vec![FilterConfig::scenario("S2")],
    ];
    let expanded = expand_resource_stack(&db, &stacks);
    assert_eq!(expanded.len(), 2);
    for (resource, stack) in expanded.iter().zip(&stacks) {
        assert_eq!(resource.identifier(), db.identifier());
        assert_eq!(&resource.metadata.filter_stack, stack);
        assert_eq!(&filter_configs_from_url(resource.url().unwrap()), stack);
    }
}

#[test]
fn cross_product_flattens_choices() {
    let a1 = file_resource("a", "/data/a1.out", None);
    let a2 = file_resource("a", "/data/a2.out", None);
    let b = file_resource("b", "/data/b.out", None);
    let combos = cross_product(&[
        vec![vec![a1.clone()], vec![a2.clone()]],
        vec![vec![b.clone()]],
    ]);
    assert_eq!(combos.len(), 2);
    assert_eq!(combos[0].len(), 2);
    // An axis with no choices eliminates everything.
    assert!(cross_product(&[vec![], vec![vec![b]]]).is_empty());
}

#[test]
fn affinity_rejects_mixed_streams_from_one_provider() {
    let file = file_resource("a", "/data/a.out", None);
    let matched = vec![tagged(&file, "S1 - x"), tagged(&file, "S1 - x")];
    assert!(check_resource_affinity(&matched));
    let mixed = vec![tagged(&file, "S1 - x"), tagged(&file, "S2 - x")];
    assert!(!check_resource_affinity(&mixed));
    let different_providers = vec![
        tagged(&file, "S1 - x"),
        tagged(&file_resource("b", "/data/b.out", None), "S2 - x"),
    ];
    assert!(check_resource_affinity(&different_providers));
}

#[test]
fn filter_ids_combine_database_and_inherited_parts() {
    let db = database_resource("a", "mysql://host/db", None, true, None);
    let file = tagged(&file_resource("b", "/data/b.out", None), "S9 - z");
    let stacks = vec![
        (
            db,
            vec![
                FilterConfig::scenario("S2"),
                FilterConfig::scenario("S1"),
            ],
        ),
        (file, Vec::new()),
    ];
    assert_eq!(make_filter_id(&stacks), "S1, S2 - a & S9 - z");
}

#[test]
fn scenario_names_deduplicate_across_stacks() {
    let stacks = vec![
        vec![FilterConfig::scenario("S1")],
        vec![
            FilterConfig::scenario("S1"),
            FilterConfig::alternatives(vec!["alt".to_string()]),
        ],
    ];
    assert_eq!(scenario_names_from_stacks(&stacks), vec!["S1"]);
}

#[test]
fn hashed_filter_ids_are_stable_and_directory_safe() {
    let hashed = hash_filter_id("S1 - a & S2 - b");
    assert_eq!(hashed, hash_filter_id("S1 - a & S2 - b"));
    assert!(hashed.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(hash_filter_id(""), "");
}
