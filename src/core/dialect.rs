//! SQL dialect differences between the supported stores
//!
//! Statements are always built with `?` placeholders; the dialect rewrites
//! them into the store's native form just before execution and supplies the
//! metadata queries a session needs.

use crate::core::database_types::DatabaseType;
use crate::core::error::{DatabaseError, Result};

/// SQL dialect of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// SQLite: `?` placeholders, `sqlite_master` metadata
    Sqlite,
    /// PostgreSQL: `$n` placeholders, `information_schema` metadata
    Postgres,
}

impl Dialect {
    /// Dialect spoken by a database type
    pub fn for_type(db_type: DatabaseType) -> Result<Self> {
        match db_type {
            DatabaseType::Sqlite => Ok(Dialect::Sqlite),
            DatabaseType::Postgres => Ok(Dialect::Postgres),
            DatabaseType::Mysql => Err(DatabaseError::unsupported(
                "no SQL dialect for mysql is available",
            )),
        }
    }

    /// Rewrite `?` placeholders into the native form.
    ///
    /// Placeholders inside quoted strings or identifiers are left alone.
    pub fn rebind(&self, sql: &str) -> String {
        match self {
            Dialect::Sqlite => sql.to_string(),
            Dialect::Postgres => {
                let mut out = String::with_capacity(sql.len() + 8);
                let mut n = 0;
                scan_placeholders(sql, |piece| match piece {
                    Piece::Text(t) => out.push_str(t),
                    Piece::Positional => {
                        n += 1;
                        out.push('$');
                        out.push_str(&n.to_string());
                    }
                });
                out
            }
        }
    }

    /// LIMIT operand meaning "no limit", needed for OFFSET without LIMIT
    pub fn no_limit(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "-1",
            Dialect::Postgres => "ALL",
        }
    }

    /// Whether `INSERT ... RETURNING` is available
    pub fn supports_returning(&self) -> bool {
        true
    }

    /// Whether the driver reports the rowid of the last insert
    pub fn has_last_insert_id(&self) -> bool {
        matches!(self, Dialect::Sqlite)
    }

    /// Names of user tables and views
    pub fn list_collections_sql(&self) -> &'static str {
        match self {
            Dialect::Sqlite => {
                "SELECT name FROM sqlite_master WHERE type IN ('table', 'view') \
                 AND name NOT LIKE 'sqlite_%' ORDER BY name"
            }
            Dialect::Postgres => {
                "SELECT table_name AS name FROM information_schema.tables \
                 WHERE table_schema = current_schema() ORDER BY table_name"
            }
        }
    }

    /// One row when the named table or view exists; takes one argument
    pub fn collection_exists_sql(&self) -> &'static str {
        match self {
            Dialect::Sqlite => {
                "SELECT name FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?"
            }
            Dialect::Postgres => {
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = ?"
            }
        }
    }

    /// Primary key column names of a table, in key order; takes one argument
    pub fn primary_keys_sql(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "SELECT name FROM pragma_table_info(?) WHERE pk > 0 ORDER BY pk",
            Dialect::Postgres => {
                "SELECT kcu.column_name AS name \
                 FROM information_schema.table_constraints tc \
                 JOIN information_schema.key_column_usage kcu \
                   ON tc.constraint_name = kcu.constraint_name \
                  AND tc.table_schema = kcu.table_schema \
                 WHERE tc.constraint_type = 'PRIMARY KEY' \
                   AND tc.table_schema = current_schema() \
                   AND tc.table_name = ? \
                 ORDER BY kcu.ordinal_position"
            }
        }
    }

    /// Statement removing every row of a table
    pub fn truncate_sql(&self, table: &str) -> String {
        match self {
            Dialect::Sqlite => format!("DELETE FROM {}", table),
            Dialect::Postgres => format!("TRUNCATE TABLE {} RESTART IDENTITY", table),
        }
    }
}

pub(crate) enum Piece<'a> {
    Text(&'a str),
    Positional,
}

/// Split SQL into text runs and `?` placeholders, skipping quoted sections.
pub(crate) fn scan_placeholders<'a>(sql: &'a str, mut emit: impl FnMut(Piece<'a>)) {
    let bytes = sql.as_bytes();
    let mut quote: Option<u8> = None;
    let mut start = 0;
    for (i, &b) in bytes.iter().enumerate() {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'?' => {
                emit(Piece::Text(&sql[start..i]));
                emit(Piece::Positional);
                start = i + 1;
            }
            None => {}
        }
    }
    emit(Piece::Text(&sql[start..]));
}

/// Number of `?` placeholders outside quoted sections
pub(crate) fn count_placeholders(sql: &str) -> usize {
    let mut n = 0;
    scan_placeholders(sql, |p| {
        if let Piece::Positional = p {
            n += 1;
        }
    });
    n
}
