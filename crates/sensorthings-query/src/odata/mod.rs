//! Query intent model: raw `$option` strings parsed into [`QueryOptions`].
//!
//! Parsing is pure and registry-agnostic. Field and navigation names are
//! resolved later by the compiler, which reports unknown names against the
//! option they came from.

mod expand;
pub mod filter;

pub use expand::{ExpandItem, MAX_EXPAND_DEPTH};
pub use filter::{
    ArithmeticOp, Comparison, ComparisonOp, Filter, FlatPredicate, Function, Literal, LogicalOp,
    Operand, Predicate, SpatialPredicate,
};

use crate::error::{QueryError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderByItem {
    pub field: String,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultFormat {
    DataArray,
}

/// Structured form of one request's query options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    pub top: Option<u64>,
    pub skip: Option<u64>,
    /// Ordered, de-duplicated; empty means every declared field
    pub select: Vec<String>,
    pub expand: Vec<ExpandItem>,
    /// Empty means identity descending
    pub order_by: Vec<OrderByItem>,
    pub filter: Option<Filter>,
    pub count: bool,
    pub ref_only: bool,
    pub result_format: Option<ResultFormat>,
}

/// Options accepted at the top level of a request.
const TOP_LEVEL_OPTIONS: &[&str] = &[
    "$top",
    "$skip",
    "$select",
    "$expand",
    "$orderby",
    "$filter",
    "$count",
    "$resultFormat",
    "$ref",
];

/// Options accepted inside `$expand=Nav(...)`.
const EXPAND_OPTIONS: &[&str] = &["$top", "$skip", "$select", "$expand", "$orderby", "$filter"];

impl QueryOptions {
    /// Parses `(name, raw value)` pairs as they appear in a query string.
    ///
    /// Unknown names fail with [`QueryError::NotImplemented`]; known names with
    /// bad values fail with [`QueryError::InvalidOption`].
    pub fn parse<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        Self::parse_with(pairs, TOP_LEVEL_OPTIONS, 0)
    }

    /// `depth` is the `$expand` nesting level the options appear at.
    pub(crate) fn parse_with<'a, I>(pairs: I, allowed: &[&str], depth: usize) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut options = QueryOptions::default();
        let mut seen: Vec<&str> = Vec::new();

        for (name, value) in pairs {
            let Some(known) = allowed.iter().copied().find(|o| o.eq_ignore_ascii_case(name)) else {
                return Err(QueryError::not_implemented(name, value));
            };
            if seen.contains(&known) {
                return Err(QueryError::invalid_option(
                    known,
                    value,
                    "option given more than once",
                ));
            }
            seen.push(known);
            options.apply(known, value, depth)?;
        }

        Ok(options)
    }

    fn apply(&mut self, option: &str, value: &str, depth: usize) -> Result<()> {
        match option {
            "$top" => self.top = Some(parse_count(option, value)?),
            "$skip" => self.skip = Some(parse_count(option, value)?),
            "$select" => self.select = parse_select(value)?,
            "$expand" => self.expand = expand::parse_expand(value, depth)?,
            "$orderby" => self.order_by = parse_order_by(value)?,
            "$filter" => self.filter = Some(Filter::parse(value)?),
            "$count" => self.count = parse_bool(option, value)?,
            "$ref" => self.ref_only = parse_bool(option, value)?,
            "$resultFormat" => {
                if value.eq_ignore_ascii_case("dataArray") {
                    self.result_format = Some(ResultFormat::DataArray);
                } else {
                    return Err(QueryError::invalid_option(
                        option,
                        value,
                        "only 'dataArray' is supported",
                    ));
                }
            }
            _ => return Err(QueryError::not_implemented(option, value)),
        }
        Ok(())
    }

    /// Rows to return: `$top` clamped to `max_top`, or `max_top` when absent.
    pub fn limit(&self, max_top: u64) -> u64 {
        self.top.map_or(max_top, |top| top.min(max_top))
    }

    /// Rows to skip: `$skip`, or zero when absent.
    pub fn offset(&self) -> u64 {
        self.skip.unwrap_or(0)
    }
}

fn parse_count(option: &str, value: &str) -> Result<u64> {
    value.trim().parse::<u64>().map_err(|_| {
        QueryError::invalid_option(option, value, "expected a non-negative integer")
    })
}

fn parse_bool(option: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(QueryError::invalid_option(
            option,
            value,
            "expected 'true' or 'false'",
        )),
    }
}

fn parse_select(value: &str) -> Result<Vec<String>> {
    let mut fields: Vec<String> = Vec::new();
    for item in value.split(',') {
        let item = item.trim();
        if item.is_empty() {
            return Err(QueryError::invalid_option(
                "$select",
                value,
                "empty field name",
            ));
        }
        if !fields.iter().any(|f| f.eq_ignore_ascii_case(item)) {
            fields.push(item.to_string());
        }
    }
    Ok(fields)
}

fn parse_order_by(value: &str) -> Result<Vec<OrderByItem>> {
    value
        .split(',')
        .map(|item| {
            let mut parts = item.split_whitespace();
            let field = parts.next().ok_or_else(|| {
                QueryError::invalid_option("$orderby", value, "empty order item")
            })?;
            let order = match parts.next().map(|d| d.to_ascii_lowercase()) {
                None => SortOrder::Asc,
                Some(d) if d == "asc" => SortOrder::Asc,
                Some(d) if d == "desc" => SortOrder::Desc,
                Some(d) => {
                    return Err(QueryError::invalid_option(
                        "$orderby",
                        value,
                        format!("unknown direction '{}'", d),
                    ))
                }
            };
            if parts.next().is_some() {
                return Err(QueryError::invalid_option(
                    "$orderby",
                    value,
                    "expected 'field [asc|desc]'",
                ));
            }
            Ok(OrderByItem {
                field: field.to_string(),
                order,
            })
        })
        .collect()
}
