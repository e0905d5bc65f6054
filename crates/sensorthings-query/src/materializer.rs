//! Rebuilds the nested entity graph from the flat rows of a compiled query.
//!
//! Materialization runs in two passes. The first walks every row, splits it
//! into per-branch column ranges and records each entity once per
//! `(parent identity, identity)` pair. The second starts at the roots and
//! attaches children depth-first through
//! [`Registry::attachment_field`].

use crate::branch::{Branch, BranchTree};
use crate::entity::{Entity, Related};
use crate::entity_type::EntityType;
use crate::error::{QueryError, Result};
use crate::registry::{FieldKind, Registry, IDENTITY_SUFFIX};
use crate::value::ColumnValue;
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use tracing::debug;

pub struct Materializer<'a> {
    registry: &'a Registry,
    base_url: &'a str,
}

/// Entities of one branch, grouped by the identity of the parent they hang off.
#[derive(Default)]
struct BranchEntities {
    seen: HashSet<(i64, i64)>,
    by_parent: HashMap<i64, Vec<Entity>>,
}

impl<'a> Materializer<'a> {
    /// `base_url` is the public root URL self links are built on.
    pub fn new(registry: &'a Registry, base_url: &'a str) -> Self {
        Self {
            registry,
            base_url: base_url.trim_end_matches('/'),
        }
    }

    pub fn self_link(&self, entity_type: EntityType, id: i64) -> String {
        format!("{}/v1.0/{}({})", self.base_url, entity_type.set_name(), id)
    }

    pub fn materialize(
        &self,
        tree: &BranchTree,
        columns: &[String],
        rows: Vec<Vec<ColumnValue>>,
    ) -> Result<Vec<Entity>> {
        let ranges = branch_ranges(tree, columns)?;
        let row_count = rows.len();

        let mut roots: Vec<Entity> = Vec::new();
        let mut root_ids: HashSet<i64> = HashSet::new();
        let mut children: Vec<BranchEntities> =
            (0..tree.len()).map(|_| BranchEntities::default()).collect();
        // identity of each branch on the row being read
        let mut current: Vec<Option<i64>> = vec![None; tree.len()];

        for (row_index, mut row) in rows.into_iter().enumerate() {
            if row.len() != columns.len() {
                return Err(QueryError::consistency(format!(
                    "row {} has {} values, expected {}",
                    row_index,
                    row.len(),
                    columns.len()
                )));
            }

            for branch in tree.branches() {
                let range = &ranges[branch.index];
                let id = match (&row[range.start], branch.parent) {
                    (ColumnValue::Integer(id), _) => *id,
                    (ColumnValue::Null, Some(_)) => {
                        current[branch.index] = None;
                        continue;
                    }
                    (other, _) => {
                        return Err(QueryError::consistency(format!(
                            "row {} has identity {:?} in column '{}'",
                            row_index, other, columns[range.start]
                        )))
                    }
                };
                current[branch.index] = Some(id);

                let Some(parent) = branch.parent else {
                    if root_ids.insert(id) {
                        roots.push(self.build(tree, branch, id, &mut row, range.clone()));
                    }
                    continue;
                };

                let Some(parent_id) = current[parent] else {
                    current[branch.index] = None;
                    continue;
                };
                let store = &mut children[branch.index];
                if store.seen.insert((parent_id, id)) {
                    let entity = self.build(tree, branch, id, &mut row, range.clone());
                    store.by_parent.entry(parent_id).or_default().push(entity);
                }
            }
        }

        for root in &mut roots {
            self.attach_children(tree, 0, root, &children)?;
        }

        debug!(
            rows = row_count,
            roots = roots.len(),
            branches = tree.len(),
            "materialized result"
        );
        Ok(roots)
    }

    fn build(
        &self,
        tree: &BranchTree,
        branch: &Branch,
        id: i64,
        row: &mut [ColumnValue],
        range: Range<usize>,
    ) -> Entity {
        let mut entity = Entity::new(branch.entity_type, id, self.self_link(branch.entity_type, id));
        if tree.is_ref_only() {
            entity.ref_only = true;
            return entity;
        }

        for (field, slot) in branch.fields.iter().zip(&mut row[range.start + 1..range.end]) {
            let value = std::mem::replace(slot, ColumnValue::Null);
            let value = match (field.kind, value) {
                (FieldKind::Code(table), ColumnValue::Integer(code)) => table
                    .value_of(code)
                    .map(|v| ColumnValue::Text(v.to_string()))
                    .unwrap_or(ColumnValue::Integer(code)),
                (_, value) => value,
            };
            entity.fields.push((field.name, value));
        }

        let expanded: Vec<_> = tree
            .children(branch.index)
            .filter_map(|c| c.navigation)
            .collect();
        for nav in &expanded {
            entity
                .relations
                .push((nav.name, Related::empty(nav.cardinality)));
        }
        for nav in self.registry.navigations(branch.entity_type) {
            if branch.shows_navigation(nav.name) && !expanded.iter().any(|e| e.name == nav.name) {
                entity.navigation_links.push(nav.name);
            }
        }
        entity
    }

    fn attach_children(
        &self,
        tree: &BranchTree,
        index: usize,
        entity: &mut Entity,
        children: &[BranchEntities],
    ) -> Result<()> {
        for child_branch in tree.children(index) {
            let Some(found) = children[child_branch.index].by_parent.get(&entity.id) else {
                continue;
            };
            let navigation = *self
                .registry
                .attachment_field(entity.entity_type, child_branch.entity_type)
                .ok_or(QueryError::UndeclaredRelation {
                    target: child_branch.entity_type,
                    by: entity.entity_type,
                })?;
            for child in found {
                // the same child can sit under several parents sharing an identity
                let mut child = child.clone();
                self.attach_children(tree, child_branch.index, &mut child, children)?;
                entity.attach(&navigation, child);
            }
        }
        Ok(())
    }
}

/// Column positions per branch, delimited by identity columns.
fn branch_ranges(tree: &BranchTree, columns: &[String]) -> Result<Vec<Range<usize>>> {
    let mut starts: Vec<usize> = columns
        .iter()
        .enumerate()
        .filter(|(_, name)| name.to_ascii_lowercase().ends_with(IDENTITY_SUFFIX))
        .map(|(i, _)| i)
        .collect();

    if starts.first() != Some(&0) && !columns.is_empty() {
        return Err(QueryError::consistency(format!(
            "first column '{}' is not an identity",
            columns[0]
        )));
    }
    if starts.len() != tree.len() {
        return Err(QueryError::consistency(format!(
            "{} identity columns for {} branches",
            starts.len(),
            tree.len()
        )));
    }

    starts.push(columns.len());
    let ranges: Vec<Range<usize>> = starts.windows(2).map(|w| w[0]..w[1]).collect();
    for (branch, range) in tree.branches().iter().zip(&ranges) {
        // unquoted aliases come back case-folded by the database
        let identity = &columns[range.start];
        if !identity.eq_ignore_ascii_case(&branch.identity_alias())
            || range.len() != 1 + branch.fields.len()
        {
            return Err(QueryError::consistency(format!(
                "columns {:?} do not match branch '{}'",
                &columns[range.clone()],
                branch.alias
            )));
        }
    }
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::odata::QueryOptions;
    use serde_json::json;

    const BASE: &str = "http://localhost:8080/";

    fn registry() -> Registry {
        Registry::sensorthings(None).unwrap()
    }

    fn tree(registry: &Registry, root: EntityType, pairs: &[(&str, &str)]) -> BranchTree {
        let options = QueryOptions::parse(pairs.iter().copied()).unwrap();
        BranchTree::build(registry, root, &options, 100).unwrap()
    }

    fn names(tree: &BranchTree) -> Vec<String> {
        tree.columns().into_iter().map(|c| c.name).collect()
    }

    fn int(i: i64) -> ColumnValue {
        ColumnValue::Integer(i)
    }

    fn text(s: &str) -> ColumnValue {
        ColumnValue::Text(s.to_string())
    }

    #[test]
    fn test_dedup_parent_with_children() {
        let registry = registry();
        let tree = tree(
            &registry,
            EntityType::Thing,
            &[("$select", "name"), ("$expand", "Datastreams($select=name)")],
        );
        let rows = vec![
            vec![int(1), text("kit"), int(12), text("temp")],
            vec![int(1), text("kit"), int(11), text("humidity")],
            vec![int(1), text("kit"), int(10), text("wind")],
        ];

        let roots = Materializer::new(&registry, BASE)
            .materialize(&tree, &names(&tree), rows)
            .unwrap();
        assert_eq!(roots.len(), 1);
        let datastreams = roots[0].related("Datastreams").unwrap();
        let ids: Vec<_> = datastreams.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![12, 11, 10]);
        assert_eq!(roots[0].self_link, "http://localhost:8080/v1.0/Things(1)");
    }

    #[test]
    fn test_null_child_means_empty_relation() {
        let registry = registry();
        let tree = tree(
            &registry,
            EntityType::Thing,
            &[("$select", "name"), ("$expand", "Datastreams($select=name)")],
        );
        let rows = vec![vec![int(3), text("bare"), ColumnValue::Null, ColumnValue::Null]];
        let roots = Materializer::new(&registry, BASE)
            .materialize(&tree, &names(&tree), rows)
            .unwrap();
        let value = serde_json::to_value(&roots[0]).unwrap();
        assert_eq!(value["Datastreams"], json!([]));
        assert!(value.get("Locations@iot.navigationLink").is_none());
    }

    #[test]
    fn test_independent_branches_cross_product() {
        // one thing with 2 datastreams and 3 locations: the join yields 6 rows
        let registry = registry();
        let tree = tree(
            &registry,
            EntityType::Thing,
            &[
                ("$select", "name"),
                ("$expand", "Datastreams($select=name),Locations($select=name)"),
            ],
        );
        let mut rows = Vec::new();
        for ds in [20, 21] {
            for loc in [30, 31, 32] {
                rows.push(vec![
                    int(1),
                    text("kit"),
                    int(ds),
                    text("ds"),
                    int(loc),
                    text("loc"),
                ]);
            }
        }
        let roots = Materializer::new(&registry, BASE)
            .materialize(&tree, &names(&tree), rows)
            .unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].related("Datastreams").unwrap().len(), 2);
        assert_eq!(roots[0].related("Locations").unwrap().len(), 3);
    }

    #[test]
    fn test_nested_branches_attach_under_their_parent() {
        let registry = registry();
        let tree = tree(
            &registry,
            EntityType::Thing,
            &[
                ("$select", "name"),
                ("$expand", "Datastreams($select=name;$expand=Sensor($select=name))"),
            ],
        );
        let rows = vec![
            vec![int(1), text("a"), int(10), text("d10"), int(5), text("s5")],
            vec![int(1), text("a"), int(11), text("d11"), int(5), text("s5")],
            vec![int(2), text("b"), int(12), text("d12"), ColumnValue::Null, ColumnValue::Null],
        ];
        let roots = Materializer::new(&registry, BASE)
            .materialize(&tree, &names(&tree), rows)
            .unwrap();
        assert_eq!(roots.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);

        let ds: Vec<_> = roots[0].related("Datastreams").unwrap().iter().collect();
        assert_eq!(ds.len(), 2);
        for d in &ds {
            let sensor = d.related("Sensor").unwrap();
            assert_eq!(sensor.iter().next().map(|s| s.id), Some(5));
        }

        let value = serde_json::to_value(&roots[1]).unwrap();
        assert_eq!(value["Datastreams"][0]["Sensor"], serde_json::Value::Null);
    }

    #[test]
    fn test_code_fields_are_mapped() {
        let registry = registry();
        let tree = tree(&registry, EntityType::Sensor, &[("$select", "encodingType")]);
        let rows = vec![vec![int(1), int(2)], vec![int(2), int(99)]];
        let roots = Materializer::new(&registry, BASE)
            .materialize(&tree, &names(&tree), rows)
            .unwrap();
        assert_eq!(roots[0].field("encodingType"), Some(&text("application/pdf")));
        assert_eq!(roots[1].field("encodingType"), Some(&int(99)));
    }

    #[test]
    fn test_ref_mode_only_self_link() {
        let registry = registry();
        let tree = tree(&registry, EntityType::Thing, &[("$ref", "true")]);
        let rows = vec![vec![int(2)], vec![int(1)]];
        let roots = Materializer::new(&registry, BASE)
            .materialize(&tree, &names(&tree), rows)
            .unwrap();
        assert_eq!(
            serde_json::to_value(&roots).unwrap(),
            json!([
                {"@iot.selfLink": "http://localhost:8080/v1.0/Things(2)"},
                {"@iot.selfLink": "http://localhost:8080/v1.0/Things(1)"}
            ])
        );
    }

    #[test]
    fn test_column_drift_is_consistency_error() {
        let registry = registry();
        let tree = tree(
            &registry,
            EntityType::Thing,
            &[("$select", "name"), ("$expand", "Datastreams($select=name)")],
        );
        let materializer = Materializer::new(&registry, BASE);

        // missing branch
        let columns = vec!["thing_id".to_string(), "thing_name".to_string()];
        let err = materializer.materialize(&tree, &columns, vec![]).unwrap_err();
        assert!(matches!(err, QueryError::Consistency(_)));

        // wrong arity
        let err = materializer
            .materialize(&tree, &names(&tree), vec![vec![int(1), text("a")]])
            .unwrap_err();
        assert!(matches!(err, QueryError::Consistency(_)));

        // null root identity
        let err = materializer
            .materialize(
                &tree,
                &names(&tree),
                vec![vec![ColumnValue::Null, text("a"), int(1), text("b")]],
            )
            .unwrap_err();
        assert!(matches!(err, QueryError::Consistency(_)));
    }

    #[test]
    fn test_case_folded_column_names() {
        let registry = registry();
        let tree = tree(
            &registry,
            EntityType::Thing,
            &[("$select", "name"), ("$expand", "Datastreams($select=name)")],
        );
        let columns: Vec<String> = names(&tree).iter().map(|c| c.to_lowercase()).collect();
        assert_eq!(columns[2], "a_datastream_id");
        let roots = Materializer::new(&registry, BASE)
            .materialize(&tree, &columns, vec![vec![int(1), text("a"), int(2), text("b")]])
            .unwrap();
        assert_eq!(roots[0].related("Datastreams").unwrap().len(), 1);
    }

    #[test]
    fn test_empty_rows() {
        let registry = registry();
        let tree = tree(&registry, EntityType::Thing, &[]);
        let roots = Materializer::new(&registry, BASE)
            .materialize(&tree, &names(&tree), vec![])
            .unwrap();
        assert!(roots.is_empty());
    }
}
