use super::{QueryOptions, EXPAND_OPTIONS};
use crate::error::{QueryError, Result};

/// One `$expand` branch: a navigation name plus the options applied to it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandItem {
    pub navigation: String,
    pub options: QueryOptions,
}

impl ExpandItem {
    pub fn new(navigation: impl Into<String>) -> Self {
        ExpandItem {
            navigation: navigation.into(),
            options: QueryOptions::default(),
        }
    }
}

/// Deepest accepted expand chain, counting `Nav(...)` levels and `/` path segments alike.
pub const MAX_EXPAND_DEPTH: usize = 16;

fn expand_error(value: &str, reason: impl Into<String>) -> QueryError {
    QueryError::invalid_option("$expand", value, reason)
}

/// Parses `Nav1($top=1;$expand=Nav2),Nav3/Nav4` found `depth` levels down.
pub(super) fn parse_expand(value: &str, depth: usize) -> Result<Vec<ExpandItem>> {
    let mut items = Vec::new();

    for item in split_top_level(value, ',').map_err(|reason| expand_error(value, reason))? {
        let item = item.trim();
        let (path, inner) = match item.find('(') {
            Some(open) => {
                let inner = item[open + 1..]
                    .strip_suffix(')')
                    .ok_or_else(|| expand_error(value, format!("unbalanced '{}'", item)))?;
                (&item[..open], Some(inner))
            }
            None => (item, None),
        };

        let segments: Vec<&str> = path.split('/').map(str::trim).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(expand_error(value, "empty navigation name"));
        }
        let item_depth = depth + segments.len();
        if item_depth > MAX_EXPAND_DEPTH {
            return Err(expand_error(
                value,
                format!("nesting deeper than {} levels", MAX_EXPAND_DEPTH),
            ));
        }

        let options = match inner {
            Some(inner) => parse_nested_options(value, inner, item_depth)?,
            None => QueryOptions::default(),
        };
        insert(&mut items, &segments, options);
    }

    Ok(items)
}

fn parse_nested_options(value: &str, inner: &str, depth: usize) -> Result<QueryOptions> {
    let parts = split_top_level(inner, ';').map_err(|reason| expand_error(value, reason))?;
    let mut pairs = Vec::with_capacity(parts.len());
    for part in parts {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (name, raw) = part
            .split_once('=')
            .ok_or_else(|| expand_error(value, format!("expected option=value, found '{}'", part)))?;
        let name = name.trim();
        if name.eq_ignore_ascii_case("$count") {
            return Err(QueryError::invalid_option(
                "$count",
                raw.trim(),
                "not supported inside $expand",
            ));
        }
        pairs.push((name, raw.trim()));
    }
    QueryOptions::parse_with(pairs, EXPAND_OPTIONS, depth)
}

/// Adds a path to the tree, reusing items that already name the same navigation.
fn insert(items: &mut Vec<ExpandItem>, path: &[&str], options: QueryOptions) {
    let Some((head, rest)) = path.split_first() else {
        return;
    };

    let index = match items
        .iter()
        .position(|i| i.navigation.eq_ignore_ascii_case(head))
    {
        Some(index) => index,
        None => {
            items.push(ExpandItem::new(*head));
            items.len() - 1
        }
    };
    let item = &mut items[index];

    if rest.is_empty() {
        let existing = std::mem::take(&mut item.options.expand);
        item.options = options;
        for child in existing {
            let navigation = child.navigation.clone();
            if !item
                .options
                .expand
                .iter()
                .any(|i| i.navigation.eq_ignore_ascii_case(&navigation))
            {
                item.options.expand.push(child);
            }
        }
    } else {
        insert(&mut item.options.expand, rest, options);
    }
}

/// Splits on `separator` outside parentheses and quotes.
fn split_top_level(input: &str, separator: char) -> std::result::Result<Vec<&str>, String> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut start = 0;

    for (i, c) in input.char_indices() {
        match c {
            '\'' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| "unbalanced ')'".to_string())?;
            }
            c if c == separator && depth == 0 && !quoted => {
                parts.push(&input[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }

    if depth != 0 || quoted {
        return Err("unbalanced parentheses or quotes".to_string());
    }
    parts.push(&input[start..]);
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_expand_top(value: &str) -> Result<Vec<ExpandItem>> {
        parse_expand(value, 0)
    }

    #[test]
    fn test_simple_list() {
        let items = parse_expand_top("Datastreams,Locations").unwrap();
        assert_eq!(
            items,
            vec![ExpandItem::new("Datastreams"), ExpandItem::new("Locations")]
        );
    }

    #[test]
    fn test_nested_options() {
        let items =
            parse_expand_top("Datastreams($select=name;$top=2;$expand=Observations($top=1))").unwrap();
        assert_eq!(items.len(), 1);
        let ds = &items[0];
        assert_eq!(ds.navigation, "Datastreams");
        assert_eq!(ds.options.select, vec!["name"]);
        assert_eq!(ds.options.top, Some(2));
        assert_eq!(ds.options.expand.len(), 1);
        assert_eq!(ds.options.expand[0].navigation, "Observations");
        assert_eq!(ds.options.expand[0].options.top, Some(1));
    }

    #[test]
    fn test_filter_with_separators_inside_quotes() {
        let items = parse_expand_top("Datastreams($filter=name eq 'a;b,c(d')").unwrap();
        let filter = items[0].options.filter.as_ref().unwrap();
        assert_eq!(filter.raw, "name eq 'a;b,c(d'");
    }

    #[test]
    fn test_paths_merge() {
        let items =
            parse_expand_top("Datastreams/Observations,Datastreams($top=3),Datastreams/Sensor").unwrap();
        assert_eq!(items.len(), 1);
        let ds = &items[0];
        assert_eq!(ds.options.top, Some(3));
        let nested: Vec<_> = ds
            .options
            .expand
            .iter()
            .map(|i| i.navigation.as_str())
            .collect();
        assert_eq!(nested, vec!["Observations", "Sensor"]);
    }

    #[test]
    fn test_nested_unknown_option_not_implemented() {
        let err = parse_expand_top("Datastreams($bogus=1)").unwrap_err();
        assert!(matches!(err, QueryError::NotImplemented { .. }));

        let err = parse_expand_top("Datastreams($ref=true)").unwrap_err();
        assert!(matches!(err, QueryError::NotImplemented { .. }));
    }

    #[test]
    fn test_malformed() {
        for raw in ["Datastreams(", "Datastreams)", "Datastreams($top)", "/Observations", ""] {
            let err = parse_expand_top(raw).unwrap_err();
            assert!(
                matches!(err, QueryError::InvalidOption { .. }),
                "{:?} -> {:?}",
                raw,
                err
            );
        }
    }

    #[test]
    fn test_count_inside_expand_is_rejected() {
        let err = parse_expand_top("Datastreams($count=true)").unwrap_err();
        match err {
            QueryError::InvalidOption { option, reason, .. } => {
                assert_eq!(option, "$count");
                assert!(reason.contains("$expand"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_expand_depth_is_bounded() {
        let within = vec!["Datastreams"; MAX_EXPAND_DEPTH].join("/");
        assert!(parse_expand_top(&within).is_ok());

        let path = vec!["Datastreams"; MAX_EXPAND_DEPTH + 1].join("/");
        assert!(matches!(
            parse_expand_top(&path).unwrap_err(),
            QueryError::InvalidOption { .. }
        ));

        // mixed nesting and paths count together
        let mixed = format!(
            "{}Observations{}",
            "Datastreams/Thing($expand=".repeat(MAX_EXPAND_DEPTH / 2),
            ")".repeat(MAX_EXPAND_DEPTH / 2)
        );
        assert!(parse_expand_top(&mixed).is_err());
    }

    #[test]
    fn test_deep_nesting_does_not_overflow() {
        let raw = format!(
            "{}Observations{}",
            "Datastreams($expand=".repeat(20_000),
            ")".repeat(20_000)
        );
        let result = std::thread::Builder::new()
            .stack_size(2 << 20)
            .spawn(move || parse_expand_top(&raw).map(|_| ()))
            .unwrap()
            .join()
            .unwrap();
        match result.unwrap_err() {
            QueryError::InvalidOption { option, reason, .. } => {
                assert_eq!(option, "$expand");
                assert!(reason.contains("nesting"), "{}", reason);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
