//! Database backend implementations
//!
//! Each backend provides a [`Driver`] for one database system. Drivers are
//! compiled in through cargo features (`sqlite` by default, `postgres`).

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub use postgres::PostgresDriver;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteDriver;

use crate::core::database::Driver;
use crate::core::database_types::DatabaseType;
use crate::core::error::{DatabaseError, Result};
use crate::core::settings::{ConnectionSettings, SessionOptions};
use std::sync::Arc;

/// Open the driver for the backend named by `settings`
///
/// # Errors
///
/// Returns `UnsupportedOperation` when the backend's feature is not enabled.
pub async fn open_driver(
    settings: &ConnectionSettings,
    options: &SessionOptions,
) -> Result<Arc<dyn Driver>> {
    match settings.database_type() {
        #[cfg(feature = "sqlite")]
        DatabaseType::Sqlite => Ok(Arc::new(SqliteDriver::open(settings, options).await?)),
        #[cfg(feature = "postgres")]
        DatabaseType::Postgres => Ok(Arc::new(PostgresDriver::open(settings, options).await?)),
        other => {
            let _ = options;
            Err(DatabaseError::unsupported(format!(
                "no driver for {} is compiled in",
                other
            )))
        }
    }
}
