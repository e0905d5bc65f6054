//! SQL compiler: one request becomes one SELECT.
//!
//! The root entity set is paged in a derived table so `$top`/`$skip` count
//! root entities, not joined rows. Every expand branch becomes a
//! `LEFT JOIN LATERAL` subquery correlated with its parent branch and paged
//! on its own. A scope ("A by B's id") becomes an identity-only
//! `INNER JOIN LATERAL` inside the root's derived table.
//!
//! ```text
//! SELECT thing.id AS thing_id, ..., A_datastream.datastream_id AS A_datastream_id, ...
//! FROM (SELECT thing.* FROM thing AS thing WHERE ... ORDER BY ... LIMIT $1 OFFSET $2) AS thing
//! LEFT JOIN LATERAL (SELECT datastream.id AS datastream_id, ... FROM datastream AS datastream
//!     WHERE datastream.thing_id = thing.id ORDER BY ... LIMIT $3 OFFSET $4) AS A_datastream ON true
//! ORDER BY thing.id DESC, A_datastream.datastream_ordinal
//! ```
//!
//! Literals are always bound as parameters.

use crate::branch::{Branch, BranchTree, OutputColumn};
use crate::entity_type::EntityType;
use crate::error::{QueryError, Result};
use crate::odata::{
    ArithmeticOp, Comparison, ComparisonOp, Filter, Function, Literal, Operand, Predicate,
    QueryOptions, SpatialPredicate,
};
use crate::registry::{ColumnExpr, FieldDef, FieldKind, Registry, SourceRef};
use crate::types::{QueryTarget, Scope};
use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use std::sync::Arc;

const SCOPE_ALIAS: &str = "scope";

/// A bound query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<Param>,
    pub tree: BranchTree,
    pub columns: Vec<OutputColumn>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledCount {
    pub sql: String,
    pub params: Vec<Param>,
}

#[derive(Debug, Clone)]
pub struct QueryCompiler {
    registry: Arc<Registry>,
    max_top: u64,
}

impl QueryCompiler {
    pub fn new(registry: Arc<Registry>, max_top: u64) -> Self {
        Self { registry, max_top }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn max_top(&self) -> u64 {
        self.max_top
    }

    pub fn compile(&self, target: &QueryTarget, options: &QueryOptions) -> Result<CompiledQuery> {
        let tree = BranchTree::build(&self.registry, target.entity_type, options, self.max_top)?;
        let mut sql = SqlBuilder::new(&self.registry);

        let root = tree.root();
        let mut select = Vec::new();
        for branch in tree.branches() {
            sql.push_select_list(branch, &mut select);
        }

        let root_order = sql.order_clause(root);
        let source = sql.root_source(target, root)?;
        let limit = sql.bind(Param::Integer(to_i64(root.limit)));
        let offset = sql.bind(Param::Integer(to_i64(root.offset)));
        let mut text = format!(
            "SELECT {} FROM (SELECT {}.* FROM {} ORDER BY {} LIMIT {} OFFSET {}) AS {}",
            select.join(", "),
            root.alias,
            source,
            root_order,
            limit,
            offset,
            root.alias
        );

        for branch in tree.branches().iter().skip(1) {
            text.push(' ');
            text.push_str(&sql.lateral_branch(&tree, branch)?);
        }

        let mut outer_order = vec![root_order];
        for branch in tree.branches().iter().skip(1) {
            outer_order.push(format!("{}.{}_ordinal", branch.alias, branch.table));
        }
        text.push_str(" ORDER BY ");
        text.push_str(&outer_order.join(", "));

        let columns = tree.columns();
        Ok(CompiledQuery {
            sql: text,
            params: sql.params,
            tree,
            columns,
        })
    }

    /// Total matching root rows: same scope and filter, no expand or paging.
    pub fn compile_count(
        &self,
        target: &QueryTarget,
        options: &QueryOptions,
    ) -> Result<CompiledCount> {
        let root_options = QueryOptions {
            filter: options.filter.clone(),
            ..QueryOptions::default()
        };
        let tree =
            BranchTree::build(&self.registry, target.entity_type, &root_options, self.max_top)?;
        let mut sql = SqlBuilder::new(&self.registry);
        let source = sql.root_source(target, tree.root())?;
        Ok(CompiledCount {
            sql: format!("SELECT COUNT(*) FROM {}", source),
            params: sql.params,
        })
    }

    /// `SELECT EXISTS(...)` for the entity a scoped collection hangs off.
    pub fn compile_exists(&self, scope: &Scope) -> CompiledCount {
        CompiledCount {
            sql: format!(
                "SELECT EXISTS(SELECT 1 FROM {} WHERE id = $1)",
                self.registry.table_of(scope.entity_type)
            ),
            params: vec![Param::Integer(scope.id)],
        }
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

struct SqlBuilder<'a> {
    registry: &'a Registry,
    schema_prefix: String,
    params: Vec<Param>,
}

impl<'a> SqlBuilder<'a> {
    fn new(registry: &'a Registry) -> Self {
        Self {
            registry,
            schema_prefix: registry.schema_prefix(),
            params: Vec::new(),
        }
    }

    fn bind(&mut self, param: Param) -> String {
        self.params.push(param);
        format!("${}", self.params.len())
    }

    /// Outer select entries for one branch, identity first.
    fn push_select_list(&self, branch: &Branch, select: &mut Vec<String>) {
        if branch.is_root() {
            select.push(format!(
                "{}.id AS {}",
                branch.alias,
                branch.identity_alias()
            ));
            for field in &branch.fields {
                select.push(format!(
                    "{} AS {}",
                    field.select_expr(&branch.alias, &self.schema_prefix),
                    branch.column_alias(field.column)
                ));
            }
        } else {
            select.push(format!(
                "{}.{}_id AS {}",
                branch.alias,
                branch.table,
                branch.identity_alias()
            ));
            for field in &branch.fields {
                select.push(format!(
                    "{}.{}_{} AS {}",
                    branch.alias,
                    branch.table,
                    field.column,
                    branch.column_alias(field.column)
                ));
            }
        }
    }

    /// `<table> AS <alias> [scope join] [WHERE ...]` for the root entity set.
    fn root_source(&mut self, target: &QueryTarget, root: &Branch) -> Result<String> {
        let mut text = format!(
            "{} AS {}",
            self.registry.table_of(root.entity_type),
            root.alias
        );
        let mut conditions = Vec::new();

        if let Some(id) = target.id {
            let p = self.bind(Param::Integer(id));
            conditions.push(format!("{}.id = {}", root.alias, p));
        }

        if let Some(scope) = &target.scope {
            let scope_table = self.registry.table_alias(scope.entity_type);
            let fragment = self.registry.relation_fragment(
                scope.entity_type,
                root.entity_type,
                scope_table,
                SourceRef::Table(&root.alias),
            )?;
            text.push_str(&format!(
                " INNER JOIN LATERAL (SELECT {t}.id AS {t}_id FROM {qt} AS {t}{join} WHERE {cond}) AS {scope} ON true",
                t = scope_table,
                qt = self.registry.table_of(scope.entity_type),
                join = fragment.join.map(|j| format!(" {}", j)).unwrap_or_default(),
                cond = fragment.condition,
                scope = SCOPE_ALIAS,
            ));
            let p = self.bind(Param::Integer(scope.id));
            conditions.push(format!("{}.{}_id = {}", SCOPE_ALIAS, scope_table, p));
        }

        if let Some(filter) = &root.filter {
            let rendered = self.render_filter(root.entity_type, &root.alias, filter)?;
            conditions.push(format!("({})", rendered));
        }

        if !conditions.is_empty() {
            text.push_str(" WHERE ");
            text.push_str(&conditions.join(" AND "));
        }
        Ok(text)
    }

    fn lateral_branch(&mut self, tree: &BranchTree, branch: &Branch) -> Result<String> {
        let parent = branch
            .parent
            .and_then(|p| tree.get(p))
            .ok_or_else(|| QueryError::consistency(format!("branch {} has no parent", branch.index)))?;
        let source = if parent.is_root() {
            SourceRef::Table(&parent.alias)
        } else {
            SourceRef::Branch {
                alias: &parent.alias,
                table: parent.table,
            }
        };

        let t = branch.table;
        let fragment =
            self.registry
                .relation_fragment(branch.entity_type, parent.entity_type, t, source)?;
        let order = self.order_clause_for(branch, t);

        let mut select = vec![format!("{t}.id AS {t}_id")];
        for field in &branch.fields {
            select.push(format!(
                "{} AS {}_{}",
                field.select_expr(t, &self.schema_prefix),
                t,
                field.column
            ));
        }
        for fk in self.registry.foreign_keys(branch.entity_type) {
            select.push(format!("{t}.{fk} AS {t}_{fk}"));
        }
        select.push(format!("row_number() OVER (ORDER BY {}) AS {}_ordinal", order, t));

        let mut conditions = vec![fragment.condition];
        if let Some(filter) = &branch.filter {
            let rendered = self.render_filter(branch.entity_type, t, filter)?;
            conditions.push(format!("({})", rendered));
        }

        let limit = self.bind(Param::Integer(to_i64(branch.limit)));
        let offset = self.bind(Param::Integer(to_i64(branch.offset)));
        Ok(format!(
            "LEFT JOIN LATERAL (SELECT {select} FROM {qt} AS {t}{join} WHERE {cond} ORDER BY {order} LIMIT {limit} OFFSET {offset}) AS {alias} ON true",
            select = select.join(", "),
            qt = self.registry.table_of(branch.entity_type),
            join = fragment.join.map(|j| format!(" {}", j)).unwrap_or_default(),
            cond = conditions.join(" AND "),
            alias = branch.alias,
        ))
    }

    fn order_clause(&self, branch: &Branch) -> String {
        self.order_clause_for(branch, &branch.alias)
    }

    /// Requested order, then identity descending as the tie breaker.
    fn order_clause_for(&self, branch: &Branch, alias: &str) -> String {
        let mut items: Vec<String> = branch
            .order_by
            .iter()
            .map(|(field, order)| {
                format!(
                    "{} {}",
                    field.compare_expr(alias, &self.schema_prefix),
                    order.sql()
                )
            })
            .collect();
        if !branch.order_by.iter().any(|(f, _)| f.is_identity()) {
            items.push(format!("{}.id DESC", alias));
        }
        items.join(", ")
    }

    fn render_filter(&mut self, entity_type: EntityType, alias: &str, filter: &Filter) -> Result<String> {
        let cx = FilterContext {
            entity_type,
            alias,
            raw: &filter.raw,
        };
        self.render_predicate(&cx, &filter.predicate)
    }

    /// Renders the flattened terms strictly left to right: `((t0 op t1) op t2)`.
    fn render_predicate(&mut self, cx: &FilterContext<'_>, predicate: &Predicate) -> Result<String> {
        let flat = predicate.flatten();
        let mut terms = flat.terms.into_iter();
        let Some(first) = terms.next() else {
            return Err(cx.invalid("empty expression"));
        };
        let mut text = self.render_term(cx, first)?;
        for (op, term) in flat.operators.iter().zip(terms) {
            let right = self.render_term(cx, term)?;
            text = format!("({} {} {})", text, op.sql(), right);
        }
        Ok(text)
    }

    fn render_term(&mut self, cx: &FilterContext<'_>, term: &Predicate) -> Result<String> {
        match term {
            Predicate::Comparison(c) => self.render_comparison(cx, c),
            Predicate::Spatial { function, args } => self.render_spatial(cx, *function, args),
            Predicate::Not(inner) => {
                let text = self.render_term(cx, inner)?;
                Ok(match inner.as_ref() {
                    Predicate::Group(_) => format!("NOT {}", text),
                    _ => format!("NOT ({})", text),
                })
            }
            Predicate::Group(inner) => {
                let text = self.render_predicate(cx, inner)?;
                // multi-term groups already come back parenthesized
                Ok(if inner.flatten().terms.len() > 1 {
                    text
                } else {
                    format!("({})", text)
                })
            }
            Predicate::Logical { .. } => self.render_predicate(cx, term),
        }
    }

    fn render_comparison(&mut self, cx: &FilterContext<'_>, c: &Comparison) -> Result<String> {
        match (&c.left, &c.right) {
            (Operand::Field { name, path }, Operand::Literal(literal)) => {
                self.render_field_comparison(cx, name, path, c.op, literal)
            }
            _ => self.render_expression_comparison(cx, c),
        }
    }

    fn field(&self, cx: &FilterContext<'_>, name: &str) -> Result<FieldDef> {
        self.registry
            .column_of(cx.entity_type, name)
            .ok_or_else(|| cx.invalid(format!("no such field '{}' on {}", name, cx.entity_type)))
    }

    /// `field op literal`, typed by the field.
    fn render_field_comparison(
        &mut self,
        cx: &FilterContext<'_>,
        name: &str,
        path: &[String],
        op: ComparisonOp,
        literal: &Literal,
    ) -> Result<String> {
        let field = self.field(cx, name)?;
        if !path.is_empty() && field.kind != FieldKind::Json {
            return Err(cx.invalid(format!("'{}' has no sub-properties", field.name)));
        }

        let expr = field.compare_expr(cx.alias, &self.schema_prefix);
        let sql_op = op.sql();
        let not_a_pattern =
            || cx.invalid(format!("'{}' does not support string functions", field.name));

        match field.kind {
            FieldKind::Identity | FieldKind::Integer => {
                if op == ComparisonOp::Like {
                    return Err(not_a_pattern());
                }
                let param = numeric_param(literal)
                    .ok_or_else(|| cx.invalid(format!("'{}' expects a number", field.name)))?;
                Ok(format!("{} {} {}", expr, sql_op, self.bind(param)))
            }
            FieldKind::Code(table) => {
                if op == ComparisonOp::Like {
                    return Err(not_a_pattern());
                }
                let code = match literal {
                    Literal::Integer(i) => Some(*i),
                    Literal::Text(s) => table.code_of(s),
                    Literal::Float(_) => None,
                }
                .ok_or_else(|| {
                    cx.invalid(format!("unknown {} '{}'", table.name, literal.as_text()))
                })?;
                Ok(format!("{} {} {}", expr, sql_op, self.bind(Param::Integer(code))))
            }
            FieldKind::Text => {
                let param = text_param(op, literal);
                Ok(format!("{} {} {}", expr, sql_op, self.bind(param)))
            }
            FieldKind::Timestamp => {
                if op == ComparisonOp::Like {
                    return Err(not_a_pattern());
                }
                let time = DateTime::parse_from_rfc3339(&literal.as_text()).map_err(|_| {
                    cx.invalid(format!("'{}' expects an RFC 3339 time", field.name))
                })?;
                let p = self.bind(Param::Timestamp(time.with_timezone(&Utc)));
                Ok(format!("{} {} {}", expr, sql_op, p))
            }
            FieldKind::Json => {
                let json = JsonValue::new(&expr, path);
                let number = match literal {
                    _ if op == ComparisonOp::Like => None,
                    Literal::Integer(i) => Some(*i as f64),
                    Literal::Float(f) => Some(*f),
                    Literal::Text(_) => None,
                };
                match number {
                    Some(value) => {
                        let p = self.bind(Param::Float(value));
                        Ok(format!("{} {} {}", json.number(), sql_op, p))
                    }
                    None => {
                        let param = text_param(op, literal);
                        Ok(format!("{} {} {}", json.text, sql_op, self.bind(param)))
                    }
                }
            }
            FieldKind::Geometry => Err(cx.invalid(format!(
                "'{}' is only filterable through spatial functions",
                field.name
            ))),
        }
    }

    /// Comparisons involving functions, arithmetic or two fields.
    fn render_expression_comparison(&mut self, cx: &FilterContext<'_>, c: &Comparison) -> Result<String> {
        if c.op == ComparisonOp::Like {
            let Operand::Literal(pattern) = &c.right else {
                return Err(cx.invalid("patterns must be literals"));
            };
            let subject = self.render_operand(cx, &c.left, ValueKind::Text)?;
            let p = self.bind(Param::Text(like_pattern(&pattern.as_text())));
            return Ok(format!("{} LIKE {}", subject, p));
        }

        let left_kind = self.kind_of(cx, &c.left)?;
        let right_kind = self.kind_of(cx, &c.right)?;
        let kind = common_kind(left_kind, right_kind).ok_or_else(|| {
            cx.invalid(format!(
                "cannot compare {} with {}",
                left_kind.map_or("text", ValueKind::name),
                right_kind.map_or("text", ValueKind::name)
            ))
        })?;
        let left = self.render_operand(cx, &c.left, kind)?;
        let right = self.render_operand(cx, &c.right, kind)?;
        Ok(format!("{} {} {}", left, c.op.sql(), right))
    }

    fn render_spatial(
        &mut self,
        cx: &FilterContext<'_>,
        function: SpatialPredicate,
        args: &[Operand],
    ) -> Result<String> {
        let a = self.render_arg(cx, args, 0, ValueKind::Geometry)?;
        let b = self.render_arg(cx, args, 1, ValueKind::Geometry)?;
        if function == SpatialPredicate::Relate {
            let pattern = self.render_arg(cx, args, 2, ValueKind::Text)?;
            return Ok(format!("public.{}({}, {}, {})", function.sql(), a, b, pattern));
        }
        Ok(format!("public.{}({}, {})", function.sql(), a, b))
    }

    /// Static type of an operand; `None` for text literals, which adapt to the other side.
    fn kind_of(&self, cx: &FilterContext<'_>, operand: &Operand) -> Result<Option<ValueKind>> {
        Ok(match operand {
            Operand::Literal(Literal::Text(_)) => None,
            Operand::Literal(_) | Operand::Arithmetic { .. } => Some(ValueKind::Number),
            Operand::Geography(_) => Some(ValueKind::Geometry),
            Operand::Field { name, .. } => Some(ValueKind::of_field(self.field(cx, name)?.kind)),
            Operand::Call { function, .. } => Some(ValueKind::returned_by(*function)),
        })
    }

    /// An operand as SQL of kind `want`.
    fn render_operand(&mut self, cx: &FilterContext<'_>, operand: &Operand, want: ValueKind) -> Result<String> {
        let (sql, kind) = match operand {
            Operand::Literal(literal) => return self.render_literal(cx, literal, want),
            Operand::Geography(wkt) => {
                if want != ValueKind::Geometry {
                    return Err(cx.invalid("geography literals are only usable in spatial functions"));
                }
                let p = self.bind(Param::Text(wkt.clone()));
                return Ok(format!("public.ST_GeomFromText({}, 4326)", p));
            }
            Operand::Field { name, path } => {
                let field = self.field(cx, name)?;
                if !path.is_empty() && field.kind != FieldKind::Json {
                    return Err(cx.invalid(format!("'{}' has no sub-properties", field.name)));
                }
                let expr = field.compare_expr(cx.alias, &self.schema_prefix);
                let sql = match (field.kind, field.expr) {
                    (FieldKind::Json, _) => JsonValue::new(&expr, path).json,
                    (FieldKind::Geometry, ColumnExpr::Geometry) => expr,
                    (FieldKind::Geometry, _) => format!("public.ST_GeomFromGeoJSON({})", expr),
                    _ => expr,
                };
                (sql, ValueKind::of_field(field.kind))
            }
            Operand::Call { function, args } => {
                (self.render_call(cx, *function, args)?, ValueKind::returned_by(*function))
            }
            Operand::Arithmetic { op, left, right } => {
                let l = self.render_operand(cx, left, ValueKind::Number)?;
                let r = self.render_operand(cx, right, ValueKind::Number)?;
                let sql = match op {
                    ArithmeticOp::Div => format!("({} / NULLIF({}, 0))", l, r),
                    ArithmeticOp::Mod => format!("(({})::bigint % NULLIF(({})::bigint, 0))", l, r),
                    _ => format!("({} {} {})", l, op.sql(), r),
                };
                (sql, ValueKind::Number)
            }
        };
        convert(cx, sql, kind, want)
    }

    fn render_arg(
        &mut self,
        cx: &FilterContext<'_>,
        args: &[Operand],
        index: usize,
        want: ValueKind,
    ) -> Result<String> {
        let arg = args
            .get(index)
            .ok_or_else(|| cx.invalid(format!("missing argument {}", index + 1)))?;
        self.render_operand(cx, arg, want)
    }

    fn render_call(&mut self, cx: &FilterContext<'_>, function: Function, args: &[Operand]) -> Result<String> {
        use ValueKind::{Geometry, Number, Text, Time};

        let extract = |part: &str, time: String| {
            format!("EXTRACT({} FROM ({}) AT TIME ZONE 'UTC')", part, time)
        };
        Ok(match function {
            Function::Length => format!("LENGTH({})", self.render_arg(cx, args, 0, Text)?),
            Function::IndexOf => {
                let haystack = self.render_arg(cx, args, 0, Text)?;
                let needle = self.render_arg(cx, args, 1, Text)?;
                format!("(STRPOS({}, {}) - 1)", haystack, needle)
            }
            Function::Substring => {
                let text = self.render_arg(cx, args, 0, Text)?;
                let start = self.render_arg(cx, args, 1, Number)?;
                match args.get(2) {
                    Some(_) => {
                        let length = self.render_arg(cx, args, 2, Number)?;
                        format!(
                            "SUBSTRING({} FROM ({})::integer + 1 FOR ({})::integer)",
                            text, start, length
                        )
                    }
                    None => format!("SUBSTRING({} FROM ({})::integer + 1)", text, start),
                }
            }
            Function::ToLower => format!("LOWER({})", self.render_arg(cx, args, 0, Text)?),
            Function::ToUpper => format!("UPPER({})", self.render_arg(cx, args, 0, Text)?),
            Function::Trim => format!("TRIM(BOTH ' ' FROM {})", self.render_arg(cx, args, 0, Text)?),
            Function::Concat => {
                let a = self.render_arg(cx, args, 0, Text)?;
                let b = self.render_arg(cx, args, 1, Text)?;
                format!("CONCAT({}, {})", a, b)
            }
            Function::Round => {
                format!("ROUND(({})::double precision)", self.render_arg(cx, args, 0, Number)?)
            }
            Function::Floor => {
                format!("FLOOR(({})::double precision)", self.render_arg(cx, args, 0, Number)?)
            }
            Function::Ceiling => {
                format!("CEILING(({})::double precision)", self.render_arg(cx, args, 0, Number)?)
            }
            Function::Year => extract("YEAR", self.render_arg(cx, args, 0, Time)?),
            Function::Month => extract("MONTH", self.render_arg(cx, args, 0, Time)?),
            Function::Day => extract("DAY", self.render_arg(cx, args, 0, Time)?),
            Function::Hour => extract("HOUR", self.render_arg(cx, args, 0, Time)?),
            Function::Minute => extract("MINUTE", self.render_arg(cx, args, 0, Time)?),
            Function::Second => extract("SECOND", self.render_arg(cx, args, 0, Time)?),
            Function::Date => self.render_arg(cx, args, 0, ValueKind::Date)?,
            Function::Time => self.render_arg(cx, args, 0, ValueKind::TimeOfDay)?,
            Function::Now => "now()".to_string(),
            Function::GeoDistance => {
                let a = self.render_arg(cx, args, 0, Geometry)?;
                let b = self.render_arg(cx, args, 1, Geometry)?;
                format!("public.ST_Distance({}, {})", a, b)
            }
            Function::GeoLength => {
                format!("public.ST_Length({})", self.render_arg(cx, args, 0, Geometry)?)
            }
        })
    }

    fn render_literal(&mut self, cx: &FilterContext<'_>, literal: &Literal, want: ValueKind) -> Result<String> {
        let text = literal.as_text();
        match want {
            ValueKind::Number => {
                let param = numeric_param(literal)
                    .or_else(|| {
                        text.trim()
                            .parse::<f64>()
                            .ok()
                            .filter(|f| f.is_finite())
                            .map(Param::Float)
                    })
                    .ok_or_else(|| cx.invalid(format!("'{}' is not a number", text)))?;
                Ok(self.bind(param))
            }
            ValueKind::Text => Ok(self.bind(text_param(ComparisonOp::Eq, literal))),
            ValueKind::Time => {
                let time = DateTime::parse_from_rfc3339(&text)
                    .map_err(|_| cx.invalid(format!("'{}' is not an RFC 3339 time", text)))?;
                Ok(self.bind(Param::Timestamp(time.with_timezone(&Utc))))
            }
            ValueKind::Date => {
                let date = NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                    .map_err(|_| cx.invalid(format!("'{}' is not a date", text)))?;
                let p = self.bind(Param::Text(date.to_string()));
                Ok(format!("CAST({} AS date)", p))
            }
            ValueKind::TimeOfDay => {
                NaiveTime::parse_from_str(&text, "%H:%M:%S%.f")
                    .or_else(|_| NaiveTime::parse_from_str(&text, "%H:%M:%S"))
                    .map_err(|_| cx.invalid(format!("'{}' is not a time of day", text)))?;
                let p = self.bind(Param::Text(text));
                Ok(format!("CAST({} AS time)", p))
            }
            ValueKind::Geometry | ValueKind::Json => Err(cx.invalid(format!(
                "'{}' needs the geography'<wkt>' form",
                text
            ))),
        }
    }
}

/// Where a filter is rendered: the entity it applies to and that entity's alias.
struct FilterContext<'f> {
    entity_type: EntityType,
    alias: &'f str,
    raw: &'f str,
}

impl FilterContext<'_> {
    fn invalid(&self, reason: impl Into<String>) -> QueryError {
        QueryError::invalid_option("$filter", self.raw, reason)
    }
}

/// SQL type a filter operand renders as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Number,
    Text,
    /// `timestamptz`
    Time,
    Date,
    TimeOfDay,
    Geometry,
    /// Untyped `jsonb`, converted where it is used
    Json,
}

impl ValueKind {
    fn of_field(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Identity | FieldKind::Integer | FieldKind::Code(_) => ValueKind::Number,
            FieldKind::Text => ValueKind::Text,
            FieldKind::Timestamp => ValueKind::Time,
            FieldKind::Json => ValueKind::Json,
            FieldKind::Geometry => ValueKind::Geometry,
        }
    }

    fn returned_by(function: Function) -> Self {
        match function {
            Function::Substring
            | Function::ToLower
            | Function::ToUpper
            | Function::Trim
            | Function::Concat => ValueKind::Text,
            Function::Date => ValueKind::Date,
            Function::Time => ValueKind::TimeOfDay,
            Function::Now => ValueKind::Time,
            _ => ValueKind::Number,
        }
    }

    fn name(self) -> &'static str {
        match self {
            ValueKind::Number => "number",
            ValueKind::Text => "text",
            ValueKind::Time => "time",
            ValueKind::Date => "date",
            ValueKind::TimeOfDay => "time of day",
            ValueKind::Geometry => "geometry",
            ValueKind::Json => "json",
        }
    }

    /// Conversions [`convert`] knows how to render.
    fn converts_to(self, to: ValueKind) -> bool {
        use ValueKind::*;
        self == to
            || matches!(
                (self, to),
                (Json, Number | Text | Time | Date | TimeOfDay)
                    | (Text, Time | Date | TimeOfDay)
                    | (Number | Time | Date | TimeOfDay, Text)
                    | (Time, Date | TimeOfDay)
            )
    }
}

/// Kind both sides of a comparison are rendered as; `None` when they cannot meet.
fn common_kind(left: Option<ValueKind>, right: Option<ValueKind>) -> Option<ValueKind> {
    let preferred = match (left, right) {
        (Some(a), Some(b)) if a == b => a,
        (Some(ValueKind::Json), Some(other)) | (Some(other), Some(ValueKind::Json)) => other,
        (Some(ValueKind::Text), Some(other)) | (Some(other), Some(ValueKind::Text)) => other,
        (Some(a), Some(b)) => {
            if b.converts_to(a) {
                a
            } else {
                b
            }
        }
        (Some(a), None) | (None, Some(a)) => a,
        (None, None) => ValueKind::Text,
    };
    let preferred = if preferred == ValueKind::Json {
        ValueKind::Text
    } else {
        preferred
    };
    let fits = |kind: Option<ValueKind>| kind.map_or(true, |k| k.converts_to(preferred));
    (preferred != ValueKind::Geometry && fits(left) && fits(right)).then_some(preferred)
}

fn convert(cx: &FilterContext<'_>, sql: String, from: ValueKind, to: ValueKind) -> Result<String> {
    use ValueKind::*;
    if from == to {
        return Ok(sql);
    }
    Ok(match (from, to) {
        (Json, Text) => json_text(&sql),
        (Json, Number) => json_number(&sql, &json_text(&sql)),
        (Json, Time | Date | TimeOfDay) => {
            let guard = format!("jsonb_typeof({}) = 'string'", sql);
            let time = text_to_time(&json_text(&sql), Some(&guard));
            return convert(cx, time, Time, to);
        }
        (Text, Time | Date | TimeOfDay) => return convert(cx, text_to_time(&sql, None), Time, to),
        (Number | Date | TimeOfDay, Text) => format!("({})::text", sql),
        (Time, Text) => format!(
            "to_char(({}) AT TIME ZONE 'UTC', 'YYYY-MM-DD\"T\"HH24:MI:SS.MS\"Z\"')",
            sql
        ),
        (Time, Date) => format!("(({}) AT TIME ZONE 'UTC')::date", sql),
        (Time, TimeOfDay) => format!("(({}) AT TIME ZONE 'UTC')::time", sql),
        _ => {
            return Err(cx.invalid(format!(
                "cannot use a {} value as {}",
                from.name(),
                to.name()
            )))
        }
    })
}

/// A JSON value inside a field, addressed by an optional key path.
struct JsonValue {
    /// `jsonb`
    json: String,
    /// The value as text
    text: String,
}

impl JsonValue {
    fn new(expr: &str, path: &[String]) -> Self {
        let path = path.join(",");
        let json = if path.is_empty() {
            expr.to_string()
        } else {
            format!("({}) #> '{{{}}}'", expr, path)
        };
        JsonValue {
            text: format!("({}) #>> '{{{}}}'", expr, path),
            json,
        }
    }

    fn number(&self) -> String {
        json_number(&self.json, &self.text)
    }
}

fn json_text(json: &str) -> String {
    format!("({}) #>> '{{}}'", json)
}

/// Non-numeric JSON values become NULL so they never match.
fn json_number(json: &str, text: &str) -> String {
    format!(
        "CASE WHEN jsonb_typeof({}) = 'number' THEN ({})::double precision END",
        json, text
    )
}

/// ISO 8601 instants; intervals (`start/end`) and free text become NULL.
fn text_to_time(text: &str, guard: Option<&str>) -> String {
    let guard = guard.map(|g| format!("{} AND ", g)).unwrap_or_default();
    format!(
        "CASE WHEN {}{} ~ '^[0-9]{{4}}-[0-9]{{2}}-[0-9]{{2}}T[^/]*$' THEN ({})::timestamptz END",
        guard, text, text
    )
}

fn numeric_param(literal: &Literal) -> Option<Param> {
    match literal {
        Literal::Integer(i) => Some(Param::Integer(*i)),
        Literal::Float(f) => Some(Param::Float(*f)),
        Literal::Text(s) => s.trim().parse::<i64>().ok().map(Param::Integer),
    }
}

/// Text parameter; patterns get `*` turned into `%`, times are normalized.
fn text_param(op: ComparisonOp, literal: &Literal) -> Param {
    let value = literal.as_text();
    if op == ComparisonOp::Like {
        return Param::Text(like_pattern(&value));
    }
    match DateTime::parse_from_rfc3339(&value) {
        Ok(time) => Param::Text(
            time.with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        ),
        Err(_) => Param::Text(value),
    }
}

fn like_pattern(value: &str) -> String {
    let mut pattern = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' | '%' | '_' => {
                pattern.push('\\');
                pattern.push(c);
            }
            '*' => pattern.push('%'),
            c => pattern.push(c),
        }
    }
    pattern
}
