//! Database type definitions
//!
//! This module defines the relational stores a session can be opened against.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Supported database types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// PostgreSQL database
    Postgres,
    /// MySQL/MariaDB database (no driver yet)
    Mysql,
    /// SQLite database
    Sqlite,
}

impl DatabaseType {
    /// Convert database type to its URI scheme
    pub fn to_str(&self) -> &'static str {
        match self {
            DatabaseType::Postgres => "postgres",
            DatabaseType::Mysql => "mysql",
            DatabaseType::Sqlite => "sqlite",
        }
    }

    /// Default network port, if the store listens on one
    pub fn default_port(&self) -> Option<u16> {
        match self {
            DatabaseType::Postgres => Some(5432),
            DatabaseType::Mysql => Some(3306),
            DatabaseType::Sqlite => None,
        }
    }

    /// Whether the store is file-backed rather than a network server
    pub fn is_embedded(&self) -> bool {
        matches!(self, DatabaseType::Sqlite)
    }

    /// Whether a driver for this store was compiled into the crate
    pub fn is_available(&self) -> bool {
        match self {
            DatabaseType::Sqlite => cfg!(feature = "sqlite"),
            DatabaseType::Postgres => cfg!(feature = "postgres"),
            DatabaseType::Mysql => false,
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

impl FromStr for DatabaseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(DatabaseType::Postgres),
            "mysql" | "mariadb" => Ok(DatabaseType::Mysql),
            "sqlite" | "sqlite3" => Ok(DatabaseType::Sqlite),
            _ => Err(format!("Invalid database type: '{}'", s)),
        }
    }
}
