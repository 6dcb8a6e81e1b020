//! Predicates for WHERE, HAVING and JOIN ... ON clauses
//!
//! A [`Condition`] is an immutable tree: structured leaves
//! (`column operator value`), membership tests, raw fragments carrying their
//! own positional arguments, and AND/OR/NOT nodes. Values are always bound as
//! parameters.
//!
//! ```
//! use rust_data_access::core::condition::{cond, Condition};
//!
//! let c = cond("title LIKE", "P%").and(Condition::is_in("author_id", [1, 2]));
//! assert_eq!(c.to_string(), "title LIKE ? AND author_id IN (?, ?)");
//! ```

use crate::core::dialect::{count_placeholders, Dialect};
use crate::core::error::{DatabaseError, Result};
use crate::core::query_builder::{ScopeKey, Selector};
use crate::core::value::DatabaseValue;
use std::fmt;

/// Comparison operators for structured conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    NotLike,
}

impl Operator {
    /// Convert operator to SQL string
    pub fn as_sql(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "<>",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Like => "LIKE",
            Operator::NotLike => "NOT LIKE",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        let op = match s.to_ascii_uppercase().split_whitespace().collect::<Vec<_>>().join(" ").as_str() {
            "=" | "==" => Operator::Eq,
            "!=" | "<>" => Operator::Ne,
            "<" => Operator::Lt,
            "<=" => Operator::Le,
            ">" => Operator::Gt,
            ">=" => Operator::Ge,
            "LIKE" => Operator::Like,
            "NOT LIKE" => Operator::NotLike,
            _ => return None,
        };
        Some(op)
    }
}

/// Predicate tree
#[derive(Debug, Clone)]
pub enum Condition {
    /// `column op ?`
    Compare {
        column: String,
        op: Operator,
        value: DatabaseValue,
    },
    /// `column IS [NOT] NULL`
    Null { column: String, negated: bool },
    /// `column [NOT] IN (?, ...)`
    In {
        column: String,
        negated: bool,
        values: Vec<DatabaseValue>,
    },
    /// `column [NOT] IN (SELECT ...)`
    InSubquery {
        column: String,
        negated: bool,
        query: Box<Selector>,
    },
    /// Backend text with its own `?` arguments
    Raw {
        text: String,
        args: Vec<DatabaseValue>,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

/// Structured condition from a `"column [operator]"` key.
///
/// The operator defaults to `=`. A `NULL` value turns `=` into `IS NULL` and
/// `<>` into `IS NOT NULL`. Operators the builder does not know, such as
/// backend-specific ones, are passed through as a raw fragment.
pub fn cond(key: &str, value: impl Into<DatabaseValue>) -> Condition {
    let value = value.into();
    let key = key.trim();
    let (column, op_text) = match key.split_once(char::is_whitespace) {
        Some((c, rest)) => (c, rest.trim()),
        None => (key, ""),
    };
    let upper = op_text.to_ascii_uppercase();
    let op = if op_text.is_empty() {
        Some(Operator::Eq)
    } else if upper == "IS" {
        Some(Operator::Eq)
    } else if upper.split_whitespace().collect::<Vec<_>>() == ["IS", "NOT"] {
        Some(Operator::Ne)
    } else {
        Operator::parse(op_text)
    };
    match op {
        Some(Operator::Eq) if value.is_null() => Condition::Null {
            column: column.to_string(),
            negated: false,
        },
        Some(Operator::Ne) if value.is_null() => Condition::Null {
            column: column.to_string(),
            negated: true,
        },
        Some(op) => Condition::Compare {
            column: column.to_string(),
            op,
            value,
        },
        None => Condition::Raw {
            text: format!("{} ?", key),
            args: vec![value],
        },
    }
}

impl Condition {
    /// Build a condition from text and arguments.
    ///
    /// Text containing `?` placeholders is a raw fragment bound to `args`.
    /// Text without placeholders and exactly one argument is a
    /// `"column [operator]"` key as in [`cond`]. Text without placeholders or
    /// arguments is a bare raw fragment.
    pub fn expr(text: &str, args: Vec<DatabaseValue>) -> Condition {
        if count_placeholders(text) == 0 && args.len() == 1 {
            let mut args = args;
            return cond(text, args.remove(0));
        }
        Condition::Raw {
            text: text.to_string(),
            args,
        }
    }

    /// Raw fragment without arguments
    pub fn raw(text: impl Into<String>) -> Condition {
        Condition::Raw {
            text: text.into(),
            args: Vec::new(),
        }
    }

    /// `column IN (values)`; an empty list matches nothing
    pub fn is_in<I, V>(column: &str, values: I) -> Condition
    where
        I: IntoIterator<Item = V>,
        V: Into<DatabaseValue>,
    {
        Condition::In {
            column: column.to_string(),
            negated: false,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// `column NOT IN (values)`; an empty list matches everything
    pub fn not_in<I, V>(column: &str, values: I) -> Condition
    where
        I: IntoIterator<Item = V>,
        V: Into<DatabaseValue>,
    {
        Condition::In {
            column: column.to_string(),
            negated: true,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// `column IN (subquery)`
    pub fn in_subquery(column: &str, query: &Selector) -> Condition {
        Condition::InSubquery {
            column: column.to_string(),
            negated: false,
            query: Box::new(query.clone()),
        }
    }

    /// `column NOT IN (subquery)`
    pub fn not_in_subquery(column: &str, query: &Selector) -> Condition {
        Condition::InSubquery {
            column: column.to_string(),
            negated: true,
            query: Box::new(query.clone()),
        }
    }

    /// `column IS NULL`
    pub fn is_null(column: &str) -> Condition {
        Condition::Null {
            column: column.to_string(),
            negated: false,
        }
    }

    /// `column IS NOT NULL`
    pub fn is_not_null(column: &str) -> Condition {
        Condition::Null {
            column: column.to_string(),
            negated: true,
        }
    }

    /// Conjunction of all conditions
    pub fn all<I: IntoIterator<Item = Condition>>(conds: I) -> Condition {
        conds
            .into_iter()
            .fold(Condition::And(Vec::new()), Condition::and)
    }

    /// Disjunction of all conditions
    pub fn any<I: IntoIterator<Item = Condition>>(conds: I) -> Condition {
        conds
            .into_iter()
            .fold(Condition::Or(Vec::new()), Condition::or)
    }

    /// `self AND other`, flattening nested conjunctions
    pub fn and(self, other: Condition) -> Condition {
        let mut parts = match self {
            Condition::And(v) => v,
            c => vec![c],
        };
        match other {
            Condition::And(v) => parts.extend(v),
            c => parts.push(c),
        }
        Condition::And(parts)
    }

    /// `self OR other`, flattening nested disjunctions
    pub fn or(self, other: Condition) -> Condition {
        let mut parts = match self {
            Condition::Or(v) => v,
            c => vec![c],
        };
        match other {
            Condition::Or(v) => parts.extend(v),
            c => parts.push(c),
        }
        Condition::Or(parts)
    }

    /// `NOT (self)`
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Condition {
        Condition::Not(Box::new(self))
    }

    /// True for an empty conjunction, which constrains nothing
    pub fn is_empty(&self) -> bool {
        matches!(self, Condition::And(v) if v.is_empty())
    }

    /// Append the SQL and arguments of this condition to `buf`
    pub(crate) fn write_sql(&self, buf: &mut SqlBuf) -> Result<()> {
        match self {
            Condition::Compare { column, op, value } => {
                buf.push(column);
                buf.push(" ");
                buf.push(op.as_sql());
                buf.push(" ?");
                buf.args.push(value.clone());
            }
            Condition::Null { column, negated } => {
                buf.push(column);
                buf.push(if *negated { " IS NOT NULL" } else { " IS NULL" });
            }
            Condition::In {
                column,
                negated,
                values,
            } => {
                if values.is_empty() {
                    buf.push(if *negated { "1 = 1" } else { "1 = 0" });
                    return Ok(());
                }
                buf.push(column);
                buf.push(if *negated { " NOT IN (" } else { " IN (" });
                buf.push(&vec!["?"; values.len()].join(", "));
                buf.push(")");
                buf.args.extend(values.iter().cloned());
            }
            Condition::InSubquery {
                column,
                negated,
                query,
            } => {
                buf.push(column);
                buf.push(if *negated { " NOT IN (" } else { " IN (" });
                query.write_select(buf)?;
                buf.push(")");
            }
            Condition::Raw { text, args } => {
                let expected = count_placeholders(text);
                if expected != args.len() {
                    return Err(DatabaseError::invalid_query(format!(
                        "fragment '{}' has {} placeholders but {} arguments",
                        text,
                        expected,
                        args.len()
                    )));
                }
                buf.push(text);
                buf.args.extend(args.iter().cloned());
            }
            Condition::And(parts) => {
                write_joined(buf, parts, " AND ", "1 = 1", |c| {
                    matches!(c, Condition::Or(v) if v.len() > 1) || matches!(c, Condition::Raw { .. })
                })?;
            }
            Condition::Or(parts) => {
                write_joined(buf, parts, " OR ", "1 = 0", |c| {
                    matches!(c, Condition::And(v) if v.len() > 1) || matches!(c, Condition::Raw { .. })
                })?;
            }
            Condition::Not(inner) => {
                buf.push("NOT (");
                inner.write_sql(buf)?;
                buf.push(")");
            }
        }
        Ok(())
    }
}

fn write_joined(
    buf: &mut SqlBuf,
    parts: &[Condition],
    sep: &str,
    empty: &str,
    needs_parens: impl Fn(&Condition) -> bool,
) -> Result<()> {
    if parts.is_empty() {
        buf.push(empty);
        return Ok(());
    }
    if parts.len() == 1 {
        return parts[0].write_sql(buf);
    }
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            buf.push(sep);
        }
        if needs_parens(part) {
            buf.push("(");
            part.write_sql(buf)?;
            buf.push(")");
        } else {
            part.write_sql(buf)?;
        }
    }
    Ok(())
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = SqlBuf::unscoped();
        match self.write_sql(&mut buf) {
            Ok(()) => f.write_str(&buf.sql),
            Err(e) => write!(f, "<invalid condition: {}>", e),
        }
    }
}

/// SQL text and arguments accumulated while compiling a statement
#[derive(Debug)]
pub(crate) struct SqlBuf {
    pub sql: String,
    pub args: Vec<DatabaseValue>,
    /// Scope of the outermost statement; embedded subqueries must match it
    pub scope: Option<ScopeKey>,
    pub dialect: Dialect,
}

impl SqlBuf {
    pub fn new(scope: Option<ScopeKey>, dialect: Dialect) -> Self {
        Self {
            sql: String::with_capacity(128),
            args: Vec::new(),
            scope,
            dialect,
        }
    }

    pub fn unscoped() -> Self {
        Self::new(None, Dialect::Sqlite)
    }

    pub fn push(&mut self, s: &str) {
        self.sql.push_str(s);
    }
}
