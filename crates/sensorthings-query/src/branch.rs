//! The expand tree as compiled: one [`Branch`] per entity set in the query,
//! numbered depth-first in the order their columns appear in a result row.

use crate::entity_type::EntityType;
use crate::error::{QueryError, Result};
use crate::odata::{Filter, QueryOptions, SortOrder};
use crate::registry::{FieldDef, FieldKind, Navigation, Registry, IDENTITY_SUFFIX};
use crate::value::ColumnKind;

#[derive(Debug, Clone)]
pub struct Branch {
    /// Depth-first position; the root is 0
    pub index: usize,
    pub parent: Option<usize>,
    pub entity_type: EntityType,
    /// Navigation on the parent that produced this branch
    pub navigation: Option<Navigation>,
    pub table: &'static str,
    /// SQL alias: the table name for the root, `<prefix>_<table>` otherwise
    pub alias: String,
    /// Selected non-identity fields, in output order
    pub fields: Vec<FieldDef>,
    /// `$select` was given, so navigation links are limited to `selected_navigations`
    pub explicit_select: bool,
    pub selected_navigations: Vec<&'static str>,
    pub filter: Option<Filter>,
    pub order_by: Vec<(FieldDef, SortOrder)>,
    pub limit: u64,
    pub offset: u64,
}

impl Branch {
    /// Result column name for one of this branch's columns.
    pub fn column_alias(&self, column: &str) -> String {
        format!("{}_{}", self.alias, column)
    }

    pub fn identity_alias(&self) -> String {
        format!("{}{}", self.alias, IDENTITY_SUFFIX)
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn shows_navigation(&self, name: &str) -> bool {
        !self.explicit_select || self.selected_navigations.iter().any(|n| *n == name)
    }
}

/// A column of the compiled result row.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputColumn {
    pub name: String,
    pub kind: ColumnKind,
    pub branch: usize,
}

#[derive(Debug, Clone)]
pub struct BranchTree {
    branches: Vec<Branch>,
    ref_only: bool,
}

impl BranchTree {
    /// Resolves `options` against the registry, starting at `root`.
    ///
    /// Unknown fields and navigations are reported against the option naming them.
    pub fn build(
        registry: &Registry,
        root: EntityType,
        options: &QueryOptions,
        max_top: u64,
    ) -> Result<Self> {
        let mut tree = BranchTree {
            branches: Vec::new(),
            ref_only: options.ref_only,
        };
        tree.add(registry, None, root, options, max_top)?;
        Ok(tree)
    }

    fn add(
        &mut self,
        registry: &Registry,
        parent: Option<(usize, Navigation)>,
        entity_type: EntityType,
        options: &QueryOptions,
        max_top: u64,
    ) -> Result<()> {
        let index = self.branches.len();
        let table = registry.table_alias(entity_type);
        let alias = if index == 0 {
            table.to_string()
        } else {
            format!("{}_{}", branch_prefix(index), table)
        };

        let mut fields = Vec::new();
        let mut selected_navigations = Vec::new();
        let explicit_select = self.ref_only || !options.select.is_empty();
        if !self.ref_only {
            if options.select.is_empty() {
                fields.extend_from_slice(registry.fields(entity_type));
            }
            for name in &options.select {
                if let Some(field) = registry.column_of(entity_type, name) {
                    if !field.is_identity() && !fields.contains(&field) {
                        fields.push(field);
                    }
                } else if let Some(nav) = registry.navigation(entity_type, name) {
                    selected_navigations.push(nav.name);
                } else {
                    return Err(QueryError::invalid_option(
                        "$select",
                        name.as_str(),
                        format!("no such field on {}", entity_type),
                    ));
                }
            }
        }

        let mut order_by = Vec::with_capacity(options.order_by.len());
        for item in &options.order_by {
            let field = registry
                .column_of(entity_type, &item.field)
                .filter(|f| !matches!(f.kind, FieldKind::Geometry))
                .ok_or_else(|| {
                    QueryError::invalid_option(
                        "$orderby",
                        item.field.as_str(),
                        format!("no sortable field on {}", entity_type),
                    )
                })?;
            order_by.push((field, item.order));
        }

        self.branches.push(Branch {
            index,
            parent: parent.map(|(p, _)| p),
            entity_type,
            navigation: parent.map(|(_, nav)| nav),
            table,
            alias,
            fields,
            explicit_select,
            selected_navigations,
            filter: options.filter.clone(),
            order_by,
            limit: options.limit(max_top),
            offset: options.offset(),
        });

        if self.ref_only {
            return Ok(());
        }

        for item in &options.expand {
            let nav = registry
                .navigation(entity_type, &item.navigation)
                .copied()
                .ok_or_else(|| {
                    QueryError::invalid_option(
                        "$expand",
                        item.navigation.as_str(),
                        format!("no such navigation on {}", entity_type),
                    )
                })?;
            self.add(registry, Some((index, nav)), nav.target, &item.options, max_top)?;
        }

        Ok(())
    }

    pub fn root(&self) -> &Branch {
        // `build` always pushes the root first
        &self.branches[0]
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn get(&self, index: usize) -> Option<&Branch> {
        self.branches.get(index)
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    pub fn is_ref_only(&self) -> bool {
        self.ref_only
    }

    pub fn children(&self, index: usize) -> impl Iterator<Item = &Branch> {
        self.branches
            .iter()
            .filter(move |b| b.parent == Some(index))
    }

    /// Result columns in emission order: each branch's identity first, then its fields.
    pub fn columns(&self) -> Vec<OutputColumn> {
        let mut columns = Vec::new();
        for branch in &self.branches {
            columns.push(OutputColumn {
                name: branch.identity_alias(),
                kind: ColumnKind::Integer,
                branch: branch.index,
            });
            for field in &branch.fields {
                columns.push(OutputColumn {
                    name: branch.column_alias(field.column),
                    kind: field.kind.column_kind(),
                    branch: branch.index,
                });
            }
        }
        columns
    }
}

/// Alias prefix for branch `index` (1-based): A..Z, AA..AZ, BA...
pub fn branch_prefix(index: usize) -> String {
    let mut n = index;
    let mut prefix = Vec::new();
    while n > 0 {
        n -= 1;
        prefix.push(b'A' + (n % 26) as u8);
        n /= 26;
    }
    prefix.reverse();
    String::from_utf8_lossy(&prefix).into_owned()
}
