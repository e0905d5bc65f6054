//! `$filter` expressions.
//!
//! Grammar. `and`/`or` chains are evaluated strictly left to right with no
//! precedence between them; arithmetic binds `mul`/`div`/`mod` before
//! `add`/`sub`.
//!
//! ```text
//! expr    := unary (("and" | "or") unary)*
//! unary   := "not" unary | term
//! term    := "(" expr ")"
//!          | pattern "(" operand "," literal ")" [test]
//!          | "substringof" "(" literal "," operand ")" [test]
//!          | spatial "(" operand ("," operand)* ")" [test]
//!          | operand cmp operand
//! test    := "eq" ("true" | "false")
//! operand := product (("add" | "sub") product)*
//! product := primary (("mul" | "div" | "mod") primary)*
//! primary := literal | field | "geography" string | func "(" [operand ("," operand)*] ")"
//! pattern := "startswith" | "endswith" | "contains"
//! cmp     := "eq" | "ne" | "gt" | "ge" | "lt" | "le"
//! ```
//!
//! Bare words starting with a digit are numeric literals when they parse as
//! numbers. On the right of a comparison any other bare word is a text
//! literal; elsewhere it is a field, optionally with a `/`-separated JSON
//! path. Parentheses are kept as [`Predicate::Group`] nodes so a grouped
//! sub-expression is evaluated as a unit.

use crate::error::{QueryError, Result};
use std::fmt;

/// Deepest accepted nesting of groups, `not` and function calls.
pub const MAX_NESTING: usize = 64;

/// Most fields and literals accepted in one expression.
pub const MAX_OPERANDS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

impl LogicalOp {
    pub fn sql(&self) -> &'static str {
        match self {
            LogicalOp::And => "AND",
            LogicalOp::Or => "OR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    /// Pattern match where `*` is the wildcard
    Like,
}

impl ComparisonOp {
    fn from_keyword(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "eq" => Some(ComparisonOp::Eq),
            "ne" => Some(ComparisonOp::Ne),
            "gt" => Some(ComparisonOp::Gt),
            "ge" => Some(ComparisonOp::Ge),
            "lt" => Some(ComparisonOp::Lt),
            "le" => Some(ComparisonOp::Le),
            _ => None,
        }
    }

    pub fn sql(&self) -> &'static str {
        match self {
            ComparisonOp::Eq => "=",
            ComparisonOp::Ne => "!=",
            ComparisonOp::Gt => ">",
            ComparisonOp::Ge => ">=",
            ComparisonOp::Lt => "<",
            ComparisonOp::Le => "<=",
            ComparisonOp::Like => "LIKE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl ArithmeticOp {
    fn from_keyword(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "add" => Some(ArithmeticOp::Add),
            "sub" => Some(ArithmeticOp::Sub),
            "mul" => Some(ArithmeticOp::Mul),
            "div" => Some(ArithmeticOp::Div),
            "mod" => Some(ArithmeticOp::Mod),
            _ => None,
        }
    }

    pub fn sql(&self) -> &'static str {
        match self {
            ArithmeticOp::Add => "+",
            ArithmeticOp::Sub => "-",
            ArithmeticOp::Mul => "*",
            ArithmeticOp::Div => "/",
            ArithmeticOp::Mod => "%",
        }
    }
}

/// Value-producing functions usable as operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Length,
    IndexOf,
    Substring,
    ToLower,
    ToUpper,
    Trim,
    Concat,
    Round,
    Floor,
    Ceiling,
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    Date,
    Time,
    Now,
    GeoDistance,
    GeoLength,
}

const FUNCTIONS: &[(&str, Function)] = &[
    ("length", Function::Length),
    ("indexof", Function::IndexOf),
    ("substring", Function::Substring),
    ("tolower", Function::ToLower),
    ("toupper", Function::ToUpper),
    ("trim", Function::Trim),
    ("concat", Function::Concat),
    ("round", Function::Round),
    ("floor", Function::Floor),
    ("ceiling", Function::Ceiling),
    ("year", Function::Year),
    ("month", Function::Month),
    ("day", Function::Day),
    ("hour", Function::Hour),
    ("minute", Function::Minute),
    ("second", Function::Second),
    ("date", Function::Date),
    ("time", Function::Time),
    ("now", Function::Now),
    ("geo.distance", Function::GeoDistance),
    ("geo.length", Function::GeoLength),
];

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        FUNCTIONS
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, f)| *f)
    }

    pub fn name(&self) -> &'static str {
        FUNCTIONS
            .iter()
            .find(|(_, f)| f == self)
            .map_or("function", |(n, _)| *n)
    }

    /// Accepted argument counts, inclusive.
    pub fn arity(&self) -> (usize, usize) {
        match self {
            Function::Now => (0, 0),
            Function::IndexOf | Function::Concat | Function::GeoDistance => (2, 2),
            Function::Substring => (2, 3),
            _ => (1, 1),
        }
    }
}

/// Boolean spatial relations between two geometries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpatialPredicate {
    Intersects,
    Within,
    Contains,
    Equals,
    Touches,
    Overlaps,
    Crosses,
    Disjoint,
    /// DE-9IM pattern match; the third argument is the pattern
    Relate,
}

const SPATIAL_PREDICATES: &[(&str, SpatialPredicate)] = &[
    ("geo.intersects", SpatialPredicate::Intersects),
    ("st_intersects", SpatialPredicate::Intersects),
    ("st_within", SpatialPredicate::Within),
    ("st_contains", SpatialPredicate::Contains),
    ("st_equals", SpatialPredicate::Equals),
    ("st_touches", SpatialPredicate::Touches),
    ("st_overlaps", SpatialPredicate::Overlaps),
    ("st_crosses", SpatialPredicate::Crosses),
    ("st_disjoint", SpatialPredicate::Disjoint),
    ("st_relate", SpatialPredicate::Relate),
];

impl SpatialPredicate {
    fn from_name(name: &str) -> Option<Self> {
        SPATIAL_PREDICATES
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, p)| *p)
    }

    pub fn arity(&self) -> usize {
        match self {
            SpatialPredicate::Relate => 3,
            _ => 2,
        }
    }

    /// PostGIS function name.
    pub fn sql(&self) -> &'static str {
        match self {
            SpatialPredicate::Intersects => "ST_Intersects",
            SpatialPredicate::Within => "ST_Within",
            SpatialPredicate::Contains => "ST_Contains",
            SpatialPredicate::Equals => "ST_Equals",
            SpatialPredicate::Touches => "ST_Touches",
            SpatialPredicate::Overlaps => "ST_Overlaps",
            SpatialPredicate::Crosses => "ST_Crosses",
            SpatialPredicate::Disjoint => "ST_Disjoint",
            SpatialPredicate::Relate => "ST_Relate",
        }
    }
}

const PATTERN_FUNCTIONS: &[&str] = &["startswith", "endswith", "contains", "substringof"];

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl Literal {
    /// Bare tokens: numeric when they parse as a number, text otherwise.
    fn from_bare(token: &str) -> Self {
        if let Ok(i) = token.parse::<i64>() {
            Literal::Integer(i)
        } else if looks_numeric(token) {
            token
                .parse::<f64>()
                .map(Literal::Float)
                .unwrap_or_else(|_| Literal::Text(token.to_string()))
        } else {
            Literal::Text(token.to_string())
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            Literal::Integer(i) => i.to_string(),
            Literal::Float(f) => f.to_string(),
            Literal::Text(s) => s.clone(),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            other => f.write_str(&other.as_text()),
        }
    }
}

// Rejects words like "inf" or "NaN" that f64 would otherwise accept.
fn looks_numeric(token: &str) -> bool {
    starts_like_number(token)
        && token
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
}

fn starts_like_number(token: &str) -> bool {
    token
        .strip_prefix('-')
        .unwrap_or(token)
        .starts_with(|c: char| c.is_ascii_digit())
}

/// One side of a comparison, or a function argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// `path` addresses keys inside a JSON field
    Field { name: String, path: Vec<String> },
    Literal(Literal),
    /// WKT from `geography'...'`
    Geography(String),
    Call {
        function: Function,
        args: Vec<Operand>,
    },
    Arithmetic {
        op: ArithmeticOp,
        left: Box<Operand>,
        right: Box<Operand>,
    },
}

impl Operand {
    pub fn field(name: impl Into<String>) -> Self {
        Operand::Field {
            name: name.into(),
            path: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub left: Operand,
    pub op: ComparisonOp,
    pub right: Operand,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Comparison(Comparison),
    Spatial {
        function: SpatialPredicate,
        args: Vec<Operand>,
    },
    Not(Box<Predicate>),
    Logical {
        op: LogicalOp,
        left: Box<Predicate>,
        right: Box<Predicate>,
    },
    Group(Box<Predicate>),
}

/// A predicate split into its terms and the operators joining them, in order.
///
/// Terms are leaves, negations, or whole parenthesized groups.
#[derive(Debug, PartialEq)]
pub struct FlatPredicate<'a> {
    pub terms: Vec<&'a Predicate>,
    pub operators: Vec<LogicalOp>,
}

impl Predicate {
    /// Descends through logical nodes only; everything else ends the descent.
    pub fn flatten(&self) -> FlatPredicate<'_> {
        let mut flat = FlatPredicate {
            terms: Vec::new(),
            operators: Vec::new(),
        };
        self.flatten_into(&mut flat);
        flat
    }

    fn flatten_into<'a>(&'a self, flat: &mut FlatPredicate<'a>) {
        match self {
            Predicate::Logical { op, left, right } => {
                left.flatten_into(flat);
                flat.operators.push(*op);
                right.flatten_into(flat);
            }
            _ => flat.terms.push(self),
        }
    }
}

/// A parsed `$filter` together with the raw text it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub raw: String,
    pub predicate: Predicate,
}

impl Filter {
    pub fn parse(raw: &str) -> Result<Self> {
        let tokens = tokenize(raw)?;
        let mut parser = Parser {
            raw,
            tokens,
            pos: 0,
            depth: 0,
            operands: 0,
        };
        let predicate = parser.expression()?;
        if let Some(token) = parser.peek() {
            return Err(parser.error(format!("unexpected {}", token)));
        }
        Ok(Filter {
            raw: raw.to_string(),
            predicate,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Str(String),
    Open,
    Close,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Word(w) => write!(f, "'{}'", w),
            Token::Str(s) => write!(f, "string '{}'", s),
            Token::Open => f.write_str("'('"),
            Token::Close => f.write_str("')'"),
            Token::Comma => f.write_str("','"),
        }
    }
}

fn filter_error(raw: &str, reason: impl Into<String>) -> QueryError {
    QueryError::invalid_option("$filter", raw, reason)
}

fn tokenize(raw: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = raw.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '\'' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('\'') if chars.peek() == Some(&'\'') => {
                            chars.next();
                            value.push('\'');
                        }
                        Some('\'') => break,
                        Some(ch) => value.push(ch),
                        None => return Err(filter_error(raw, "unterminated string literal")),
                    }
                }
                tokens.push(Token::Str(value));
            }
            _ => {
                let mut word = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_whitespace() || matches!(ch, '(' | ')' | ',' | '\'') {
                        break;
                    }
                    word.push(ch);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }

    if tokens.is_empty() {
        return Err(filter_error(raw, "empty expression"));
    }
    Ok(tokens)
}

struct Parser<'a> {
    raw: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    operands: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn error(&self, reason: impl Into<String>) -> QueryError {
        filter_error(self.raw, reason)
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(self.error(format!("expected {}, found {}", expected, token))),
            None => Err(self.error(format!("expected {}, found end of input", expected))),
        }
    }

    /// Runs `parse` one nesting level down.
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_NESTING {
            return Err(self.error(format!("nesting deeper than {} levels", MAX_NESTING)));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn expression(&mut self) -> Result<Predicate> {
        let mut left = self.unary()?;
        while let Some(op) = self.logical_op() {
            self.pos += 1;
            let right = self.unary()?;
            left = Predicate::Logical {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn logical_op(&self) -> Option<LogicalOp> {
        match self.peek() {
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("and") => Some(LogicalOp::And),
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("or") => Some(LogicalOp::Or),
            _ => None,
        }
    }

    fn unary(&mut self) -> Result<Predicate> {
        if self.peek_keyword("not") {
            self.pos += 1;
            let inner = self.nested(|p| p.unary())?;
            return Ok(Predicate::Not(Box::new(inner)));
        }
        self.term()
    }

    fn term(&mut self) -> Result<Predicate> {
        if self.peek() == Some(&Token::Open) {
            self.pos += 1;
            let inner = self.nested(|p| p.expression())?;
            self.expect(Token::Close)?;
            return Ok(Predicate::Group(Box::new(inner)));
        }

        let call = match (self.peek(), self.tokens.get(self.pos + 1)) {
            (Some(Token::Word(name)), Some(Token::Open)) => Some(name.to_ascii_lowercase()),
            _ => None,
        };
        if let Some(name) = call {
            if PATTERN_FUNCTIONS.contains(&name.as_str()) {
                self.pos += 1;
                let predicate = self.pattern(&name)?;
                return self.boolean_test(predicate);
            }
            if let Some(function) = SpatialPredicate::from_name(&name) {
                self.pos += 1;
                let predicate = self.spatial(&name, function)?;
                return self.boolean_test(predicate);
            }
        }

        if self.peek().is_none() {
            return Err(self.error("unexpected end of input"));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Predicate> {
        let left = self.operand(false)?;
        let op = match self.next() {
            Some(Token::Word(w)) => ComparisonOp::from_keyword(&w)
                .ok_or_else(|| self.error(format!("unknown operator '{}'", w)))?,
            Some(token) => return Err(self.error(format!("expected operator, found {}", token))),
            None => return Err(self.error("expected operator, found end of input")),
        };
        let right = self.operand(true)?;
        Ok(Predicate::Comparison(Comparison { left, op, right }))
    }

    /// `startswith`, `endswith`, `contains` and `substringof` become `like`.
    fn pattern(&mut self, name: &str) -> Result<Predicate> {
        let [first, second] = self.fixed_arguments::<2>(name)?;
        let (subject, needle) = if name == "substringof" {
            (second, first)
        } else {
            (first, second)
        };
        let Operand::Literal(needle) = needle else {
            return Err(self.error(format!("{}() expects a literal pattern", name)));
        };
        let needle = needle.as_text();
        let pattern = match name {
            "startswith" => format!("{}*", needle),
            "endswith" => format!("*{}", needle),
            _ => format!("*{}*", needle),
        };
        Ok(Predicate::Comparison(Comparison {
            left: subject,
            op: ComparisonOp::Like,
            right: Operand::Literal(Literal::Text(pattern)),
        }))
    }

    fn spatial(&mut self, name: &str, function: SpatialPredicate) -> Result<Predicate> {
        let args = self.arguments(name)?;
        if args.len() != function.arity() {
            return Err(self.error(format!(
                "{}() takes {} arguments, found {}",
                name,
                function.arity(),
                args.len()
            )));
        }
        Ok(Predicate::Spatial { function, args })
    }

    /// Optional `eq true` / `eq false` after a boolean function.
    fn boolean_test(&mut self, predicate: Predicate) -> Result<Predicate> {
        if !self.peek_keyword("eq") {
            return Ok(predicate);
        }
        self.pos += 1;
        match self.next() {
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("true") => Ok(predicate),
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("false") => {
                Ok(Predicate::Not(Box::new(predicate)))
            }
            _ => Err(self.error("boolean functions compare only with true or false")),
        }
    }

    /// `bare_text` reads non-numeric bare words as text literals instead of fields.
    fn operand(&mut self, bare_text: bool) -> Result<Operand> {
        let mut left = self.product(bare_text)?;
        while let Some(op) = self.arithmetic_op(&[ArithmeticOp::Add, ArithmeticOp::Sub]) {
            self.pos += 1;
            let right = self.product(bare_text)?;
            left = Operand::Arithmetic {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn product(&mut self, bare_text: bool) -> Result<Operand> {
        let mut left = self.primary(bare_text)?;
        while let Some(op) =
            self.arithmetic_op(&[ArithmeticOp::Mul, ArithmeticOp::Div, ArithmeticOp::Mod])
        {
            self.pos += 1;
            let right = self.primary(bare_text)?;
            left = Operand::Arithmetic {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn arithmetic_op(&self, accepted: &[ArithmeticOp]) -> Option<ArithmeticOp> {
        match self.peek() {
            Some(Token::Word(w)) => ArithmeticOp::from_keyword(w).filter(|op| accepted.contains(op)),
            _ => None,
        }
    }

    fn primary(&mut self, bare_text: bool) -> Result<Operand> {
        self.operands += 1;
        if self.operands > MAX_OPERANDS {
            return Err(self.error(format!("more than {} operands", MAX_OPERANDS)));
        }

        match self.next() {
            Some(Token::Str(s)) => Ok(Operand::Literal(Literal::Text(s))),
            Some(Token::Word(w)) if self.peek() == Some(&Token::Open) => self.call(&w),
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("geography") => match self.next() {
                Some(Token::Str(wkt)) => Ok(Operand::Geography(wkt)),
                _ => Err(self.error("expected geography'<wkt>'")),
            },
            Some(Token::Word(w)) if bare_text || starts_like_number(&w) => {
                Ok(Operand::Literal(Literal::from_bare(&w)))
            }
            Some(Token::Word(w)) => field(self.raw, &w),
            Some(token) => Err(self.error(format!("expected field or literal, found {}", token))),
            None => Err(self.error("expected field or literal, found end of input")),
        }
    }

    fn call(&mut self, name: &str) -> Result<Operand> {
        let function = Function::from_name(name)
            .ok_or_else(|| self.error(format!("unsupported function '{}'", name)))?;
        let args = self.arguments(function.name())?;
        let (min, max) = function.arity();
        if args.len() < min || args.len() > max {
            let expected = if min == max {
                min.to_string()
            } else {
                format!("{} to {}", min, max)
            };
            return Err(self.error(format!(
                "{}() takes {} arguments, found {}",
                function.name(),
                expected,
                args.len()
            )));
        }
        Ok(Operand::Call { function, args })
    }

    /// `"(" [operand ("," operand)*] ")"`
    fn arguments(&mut self, name: &str) -> Result<Vec<Operand>> {
        self.expect(Token::Open)?;
        self.nested(|p| {
            let mut args = Vec::new();
            if p.peek() == Some(&Token::Close) {
                p.pos += 1;
                return Ok(args);
            }
            loop {
                args.push(p.operand(false)?);
                match p.next() {
                    Some(Token::Comma) => continue,
                    Some(Token::Close) => return Ok(args),
                    Some(token) => {
                        return Err(p.error(format!(
                            "expected ',' or ')' in {}(), found {}",
                            name, token
                        )))
                    }
                    None => return Err(p.error(format!("unterminated {}()", name))),
                }
            }
        })
    }

    fn fixed_arguments<const N: usize>(&mut self, name: &str) -> Result<[Operand; N]> {
        let args = self.arguments(name)?;
        let found = args.len();
        args.try_into()
            .map_err(|_| self.error(format!("{}() takes {} arguments, found {}", name, N, found)))
    }
}

fn field(raw: &str, word: &str) -> Result<Operand> {
    let mut segments = word.split('/');
    let name = segments.next().unwrap_or_default().to_string();
    let path: Vec<String> = segments.map(str::to_string).collect();

    let valid_segment =
        |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_segment(&name) || path.iter().any(|s| !valid_segment(s)) {
        return Err(filter_error(raw, format!("invalid field '{}'", word)));
    }

    Ok(Operand::Field { name, path })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(field: &str, op: ComparisonOp, literal: Literal) -> Predicate {
        Predicate::Comparison(Comparison {
            left: Operand::field(field),
            op,
            right: Operand::Literal(literal),
        })
    }

    fn parse(raw: &str) -> Predicate {
        Filter::parse(raw).unwrap().predicate
    }

    fn reason(raw: &str) -> String {
        match Filter::parse(raw).unwrap_err() {
            QueryError::InvalidOption { option, reason, .. } => {
                assert_eq!(option, "$filter");
                reason
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_simple_comparison() {
        assert_eq!(
            parse("name eq 'Kitchen'"),
            leaf("name", ComparisonOp::Eq, Literal::Text("Kitchen".into()))
        );
    }

    #[test]
    fn test_literal_typing() {
        let p = parse("result gt 20");
        assert_eq!(p, leaf("result", ComparisonOp::Gt, Literal::Integer(20)));

        let p = parse("result le -1.5");
        assert_eq!(p, leaf("result", ComparisonOp::Le, Literal::Float(-1.5)));

        let p = parse("time ge 2015-01-01T00:00:00Z");
        assert_eq!(
            p,
            leaf("time", ComparisonOp::Ge, Literal::Text("2015-01-01T00:00:00Z".into()))
        );
    }

    #[test]
    fn test_bare_words_on_the_right_are_text() {
        let p = parse("name eq inf");
        assert_eq!(p, leaf("name", ComparisonOp::Eq, Literal::Text("inf".into())));

        // function arguments always name fields
        let p = parse("tolower(name) eq toupper(description)");
        assert_eq!(
            p,
            Predicate::Comparison(Comparison {
                left: Operand::Call {
                    function: Function::ToLower,
                    args: vec![Operand::field("name")],
                },
                op: ComparisonOp::Eq,
                right: Operand::Call {
                    function: Function::ToUpper,
                    args: vec![Operand::field("description")],
                },
            })
        );
    }

    #[test]
    fn test_escaped_quote() {
        let p = parse("name eq 'O''Brien'");
        assert_eq!(p, leaf("name", ComparisonOp::Eq, Literal::Text("O'Brien".into())));
    }

    #[test]
    fn test_string_functions_lower_to_like() {
        let p = parse("startswith(name, 'Kit')");
        assert_eq!(p, leaf("name", ComparisonOp::Like, Literal::Text("Kit*".into())));

        let p = parse("endswith(name,'hen')");
        assert_eq!(p, leaf("name", ComparisonOp::Like, Literal::Text("*hen".into())));

        let p = parse("contains(description, 'tch')");
        assert_eq!(
            p,
            leaf("description", ComparisonOp::Like, Literal::Text("*tch*".into()))
        );

        // needle first
        let p = parse("substringof('tch', description)");
        assert_eq!(
            p,
            leaf("description", ComparisonOp::Like, Literal::Text("*tch*".into()))
        );
    }

    #[test]
    fn test_boolean_function_tests() {
        let p = parse("startswith(name,'K') eq true");
        assert_eq!(p, leaf("name", ComparisonOp::Like, Literal::Text("K*".into())));

        let p = parse("substringof('x', name) eq false");
        assert_eq!(
            p,
            Predicate::Not(Box::new(leaf(
                "name",
                ComparisonOp::Like,
                Literal::Text("*x*".into())
            )))
        );

        assert!(reason("startswith(name,'K') eq 1").contains("true or false"));
    }

    #[test]
    fn test_not() {
        let p = parse("not name eq 'a' and id eq 1");
        let flat = p.flatten();
        assert_eq!(flat.terms.len(), 2);
        assert_eq!(
            flat.terms[0],
            &Predicate::Not(Box::new(leaf("name", ComparisonOp::Eq, Literal::Text("a".into()))))
        );

        let p = parse("not (a eq 1 or b eq 2)");
        match p {
            Predicate::Not(inner) => assert!(matches!(*inner, Predicate::Group(_))),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_value_functions_as_operands() {
        let p = parse("tolower(name) eq 'kitchen'");
        assert_eq!(
            p,
            Predicate::Comparison(Comparison {
                left: Operand::Call {
                    function: Function::ToLower,
                    args: vec![Operand::field("name")],
                },
                op: ComparisonOp::Eq,
                right: Operand::Literal(Literal::Text("kitchen".into())),
            })
        );

        let p = parse("length(trim(name)) gt 3");
        match p {
            Predicate::Comparison(Comparison {
                left: Operand::Call { function, args },
                ..
            }) => {
                assert_eq!(function, Function::Length);
                assert!(matches!(args[0], Operand::Call { function: Function::Trim, .. }));
            }
            other => panic!("unexpected: {:?}", other),
        }

        let p = parse("year(now()) ge 2020");
        assert!(matches!(p, Predicate::Comparison(_)));
    }

    #[test]
    fn test_arithmetic_precedence() {
        // result add (2 mul 3)
        let p = parse("result add 2 mul 3 gt 10");
        let expected = Operand::Arithmetic {
            op: ArithmeticOp::Add,
            left: Box::new(Operand::field("result")),
            right: Box::new(Operand::Arithmetic {
                op: ArithmeticOp::Mul,
                left: Box::new(Operand::Literal(Literal::Integer(2))),
                right: Box::new(Operand::Literal(Literal::Integer(3))),
            }),
        };
        match p {
            Predicate::Comparison(c) => {
                assert_eq!(c.left, expected);
                assert_eq!(c.op, ComparisonOp::Gt);
            }
            other => panic!("unexpected: {:?}", other),
        }

        // (id sub 1) sub 1
        let p = parse("id sub 1 sub 1 eq 0");
        match p {
            Predicate::Comparison(Comparison {
                left: Operand::Arithmetic { op, left, .. },
                ..
            }) => {
                assert_eq!(op, ArithmeticOp::Sub);
                assert!(matches!(*left, Operand::Arithmetic { op: ArithmeticOp::Sub, .. }));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_spatial_predicates() {
        let p = parse("geo.intersects(location, geography'POINT(5 52)')");
        assert_eq!(
            p,
            Predicate::Spatial {
                function: SpatialPredicate::Intersects,
                args: vec![
                    Operand::field("location"),
                    Operand::Geography("POINT(5 52)".into())
                ],
            }
        );

        let p = parse("st_within(feature, geography'POLYGON((0 0,0 9,9 9,0 0))') eq false");
        match p {
            Predicate::Not(inner) => assert!(matches!(
                *inner,
                Predicate::Spatial {
                    function: SpatialPredicate::Within,
                    ..
                }
            )),
            other => panic!("unexpected: {:?}", other),
        }

        let p = parse("geo.distance(location, geography'POINT(5 52)') lt 0.5");
        assert!(matches!(
            p,
            Predicate::Comparison(Comparison {
                left: Operand::Call {
                    function: Function::GeoDistance,
                    ..
                },
                ..
            })
        ));
    }

    #[test]
    fn test_function_arity_and_names() {
        assert!(reason("length(name, 1) eq 2").contains("takes 1 arguments"));
        assert!(reason("substring(name) eq 'a'").contains("2 to 3"));
        assert!(reason("st_relate(location, feature)").contains("takes 3 arguments"));
        assert!(reason("soundex(name) eq 'x'").contains("unsupported function"));
        assert!(reason("contains(name, description)").contains("literal pattern"));
        assert!(reason("geo.intersects(location, geography 5)").contains("geography"));
    }

    #[test]
    fn test_left_to_right_chain() {
        let p = parse("a eq 1 and b eq 2 or c eq 3");
        let expected = Predicate::Logical {
            op: LogicalOp::Or,
            left: Box::new(Predicate::Logical {
                op: LogicalOp::And,
                left: Box::new(leaf("a", ComparisonOp::Eq, Literal::Integer(1))),
                right: Box::new(leaf("b", ComparisonOp::Eq, Literal::Integer(2))),
            }),
            right: Box::new(leaf("c", ComparisonOp::Eq, Literal::Integer(3))),
        };
        assert_eq!(p, expected);
    }

    #[test]
    fn test_or_then_and_has_no_precedence() {
        // evaluated as (a or b) and c
        match parse("a eq 1 or b eq 2 and c eq 3") {
            Predicate::Logical {
                op: LogicalOp::And,
                left,
                ..
            } => assert!(matches!(*left, Predicate::Logical { op: LogicalOp::Or, .. })),
            other => panic!("unexpected tree: {:?}", other),
        }
    }

    #[test]
    fn test_flatten_chain() {
        let p = parse("a eq 1 and b eq 2 or c eq 3");
        let flat = p.flatten();
        assert_eq!(flat.terms.len(), 3);
        assert_eq!(flat.operators, vec![LogicalOp::And, LogicalOp::Or]);
        assert_eq!(
            flat.terms[2],
            &leaf("c", ComparisonOp::Eq, Literal::Integer(3))
        );
    }

    #[test]
    fn test_flatten_stops_at_groups() {
        let p = parse("a eq 1 or (b eq 2 and (c eq 3 or d eq 4))");
        let flat = p.flatten();
        assert_eq!(flat.terms.len(), 2);
        assert_eq!(flat.operators, vec![LogicalOp::Or]);
        match flat.terms[1] {
            Predicate::Group(inner) => {
                let inner = inner.flatten();
                assert_eq!(inner.terms.len(), 2);
                assert_eq!(inner.operators, vec![LogicalOp::And]);
                assert!(matches!(inner.terms[1], Predicate::Group(_)));
            }
            other => panic!("expected group, got {:?}", other),
        }
    }

    #[test]
    fn test_json_path_field() {
        match parse("properties/owner/name eq 'alice'") {
            Predicate::Comparison(Comparison {
                left: Operand::Field { name, path },
                ..
            }) => {
                assert_eq!(name, "properties");
                assert_eq!(path, vec!["owner".to_string(), "name".to_string()]);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(Filter::parse("properties/o'x eq 1").is_err());
        assert!(Filter::parse("properties//x eq 1").is_err());
    }

    #[test]
    fn test_malformed_filters() {
        for raw in [
            "",
            "name",
            "name eq",
            "name is 'x'",
            "(name eq 'x'",
            "name eq 'x')",
            "name eq 'x' and",
            "name eq 'unterminated",
            "startswith(name 'x')",
            "not",
            "tolower(name",
            "name add eq 1",
        ] {
            let err = Filter::parse(raw).unwrap_err();
            assert!(
                matches!(err, QueryError::InvalidOption { ref option, .. } if option == "$filter"),
                "{:?} -> {:?}",
                raw,
                err
            );
        }
    }

    #[test]
    fn test_keywords_case_insensitive() {
        let p = parse("a EQ 1 AND NOT b Eq 2 and ToLower(name) eq 'x'");
        assert!(matches!(p, Predicate::Logical { op: LogicalOp::And, .. }));
    }

    #[test]
    fn test_nesting_within_limit_parses() {
        let depth = MAX_NESTING - 1;
        let raw = format!("{}name eq 'a'{}", "(".repeat(depth), ")".repeat(depth));
        assert!(Filter::parse(&raw).is_ok());
    }

    // Runs on a small stack like a runtime worker thread; exceeding it would abort.
    fn parse_on_small_stack(raw: String) -> Result<Filter> {
        std::thread::Builder::new()
            .stack_size(2 << 20)
            .spawn(move || Filter::parse(&raw))
            .unwrap()
            .join()
            .unwrap()
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let groups = format!("{}name eq 'a'{}", "(".repeat(20_000), ")".repeat(20_000));
        let negations = format!("{}name eq 'a'", "not ".repeat(20_000));
        let calls = format!("{}name{} eq 'a'", "tolower(".repeat(20_000), ")".repeat(20_000));

        for raw in [groups, negations, calls] {
            match parse_on_small_stack(raw).unwrap_err() {
                QueryError::InvalidOption { option, reason, .. } => {
                    assert_eq!(option, "$filter");
                    assert!(reason.contains("nesting"), "{}", reason);
                }
                other => panic!("unexpected error: {:?}", other),
            }
        }
    }

    #[test]
    fn test_long_chains_are_rejected() {
        let chain = vec!["id eq 1"; 20_000].join(" or ");
        match parse_on_small_stack(chain).unwrap_err() {
            QueryError::InvalidOption { reason, .. } => assert!(reason.contains("operands")),
            other => panic!("unexpected error: {:?}", other),
        }

        let sums = format!("id{} eq 1", " add 1".repeat(20_000));
        assert!(parse_on_small_stack(sums).is_err());

        let moderate = vec!["id eq 1"; 200].join(" or ");
        assert!(Filter::parse(&moderate).is_ok());
    }
}
