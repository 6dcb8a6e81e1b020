//! Compiled statements
//!
//! A [`Statement`] is SQL text with `?` placeholders plus the arguments bound to
//! them, in order. Arguments are always sent to the backend as parameters and
//! never spliced into the text.

use crate::core::dialect::{count_placeholders, Dialect};
use crate::core::error::{DatabaseError, Result};
use crate::core::value::DatabaseValue;
use std::fmt;

/// SQL text plus positional arguments
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Statement {
    pub sql: String,
    pub args: Vec<DatabaseValue>,
}

impl Statement {
    /// Statement with positional `?` arguments
    pub fn new(sql: impl Into<String>, args: Vec<DatabaseValue>) -> Self {
        Self {
            sql: sql.into(),
            args,
        }
    }

    /// Statement without arguments
    pub fn raw(sql: impl Into<String>) -> Self {
        Self::new(sql, Vec::new())
    }

    /// Statement with `:name` placeholders.
    ///
    /// Each placeholder is replaced by `?` and its value appended to the
    /// arguments, so a name used twice binds twice. `::` casts and quoted
    /// sections are left untouched.
    ///
    /// # Errors
    ///
    /// Returns `InvalidQuery` when a placeholder has no value.
    pub fn named(sql: &str, params: &[(&str, DatabaseValue)]) -> Result<Self> {
        let bytes = sql.as_bytes();
        let mut out = String::with_capacity(sql.len());
        let mut args = Vec::new();
        let mut quote: Option<u8> = None;
        let mut i = 0;
        while i < bytes.len() {
            let b = bytes[i];
            if let Some(q) = quote {
                if b == q {
                    quote = None;
                }
                let ch_len = sql[i..].chars().next().map_or(1, char::len_utf8);
                out.push_str(&sql[i..i + ch_len]);
                i += ch_len;
                continue;
            }
            match b {
                b'\'' | b'"' => {
                    quote = Some(b);
                    out.push(b as char);
                    i += 1;
                }
                b':' if bytes.get(i + 1) == Some(&b':') => {
                    out.push_str("::");
                    i += 2;
                }
                b':' if bytes
                    .get(i + 1)
                    .is_some_and(|c| c.is_ascii_alphabetic() || *c == b'_') =>
                {
                    let start = i + 1;
                    let mut end = start;
                    while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_')
                    {
                        end += 1;
                    }
                    let name = &sql[start..end];
                    let value = params
                        .iter()
                        .find(|(n, _)| *n == name)
                        .map(|(_, v)| v.clone())
                        .ok_or_else(|| {
                            DatabaseError::invalid_query(format!(
                                "no value for named parameter ':{}'",
                                name
                            ))
                        })?;
                    args.push(value);
                    out.push('?');
                    i = end;
                }
                _ => {
                    let ch_len = sql[i..].chars().next().map_or(1, char::len_utf8);
                    out.push_str(&sql[i..i + ch_len]);
                    i += ch_len;
                }
            }
        }
        Ok(Self { sql: out, args })
    }

    /// Check that the number of placeholders matches the arguments
    pub fn validate(&self) -> Result<()> {
        let expected = count_placeholders(&self.sql);
        if expected != self.args.len() {
            return Err(DatabaseError::invalid_query(format!(
                "statement has {} placeholders but {} arguments",
                expected,
                self.args.len()
            )));
        }
        Ok(())
    }

    /// Copy with placeholders in the dialect's native form
    pub fn rebind(&self, dialect: Dialect) -> Statement {
        Statement {
            sql: dialect.rebind(&self.sql),
            args: self.args.clone(),
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}
