//! PostgreSQL backend
//!
//! Connections come from a `deadpool-postgres` pool over `tokio-postgres`.
//! Statements are prepared (and cached per connection) so each argument can
//! be converted to the exact type the server expects for its parameter.

use crate::core::database::{Connection, Driver, ExecResult, PoolStats, RowStream};
use crate::core::database_types::DatabaseType;
use crate::core::dialect::Dialect;
use crate::core::error::{DatabaseError, Result};
use crate::core::settings::{ConnectionSettings, SessionOptions};
use crate::core::statement::Statement;
use crate::core::value::{ColumnValue, DatabaseRow, DatabaseValue};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use deadpool_postgres::{
    Config, ManagerConfig, Object, Pool, PoolConfig, PoolError, RecyclingMethod, Runtime,
};
use futures_util::StreamExt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::{FromSql, ToSql, Type};
use tokio_postgres::{Column, NoTls, Row};

type Param = Box<dyn ToSql + Sync + Send>;
type WireError = Box<dyn std::error::Error + Sync + Send>;

/// Pooled PostgreSQL driver
pub struct PostgresDriver {
    pool: Pool,
    operation_timeout: Duration,
    acquire_timeout: Duration,
}

impl PostgresDriver {
    /// Create the pool and check that the server is reachable
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedOperation` when TLS is required, or a connection
    /// error when the pool cannot be created or the server is unreachable.
    pub async fn open(settings: &ConnectionSettings, options: &SessionOptions) -> Result<Self> {
        if let Some(mode @ ("require" | "verify-ca" | "verify-full")) = settings.option("sslmode")
        {
            return Err(DatabaseError::unsupported(format!(
                "sslmode={} needs TLS, which this driver does not provide",
                mode
            )));
        }

        let mut config = Config::new();
        config.host = Some(settings.host().unwrap_or("localhost").to_string());
        config.port = settings.port();
        config.dbname = Some(settings.database().to_string());
        config.user = settings.user().map(str::to_string);
        config.password = settings.password().map(str::to_string);
        config.application_name = settings.option("application_name").map(str::to_string);
        config.connect_timeout = Some(options.timeout);
        config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        let mut pool_config = PoolConfig::new(options.max_size.max(1));
        pool_config.timeouts.wait = Some(options.timeout);
        pool_config.timeouts.create = Some(options.timeout);
        pool_config.timeouts.recycle = Some(options.timeout);
        config.pool = Some(pool_config);

        let pool = config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::connection(format!("Failed to create pool: {}", e)))?;

        let driver = Self {
            pool,
            operation_timeout: options.operation_timeout,
            acquire_timeout: options.timeout,
        };
        drop(driver.get().await?);
        tracing::debug!(
            host = settings.host().unwrap_or("localhost"),
            database = settings.database(),
            "PostgreSQL pool created"
        );
        Ok(driver)
    }

    async fn get(&self) -> Result<Object> {
        self.pool.get().await.map_err(|e| match e {
            PoolError::Timeout(_) => {
                let status = self.pool.status();
                if status.size >= status.max_size {
                    DatabaseError::pool_exhausted(status.size, status.max_size)
                } else {
                    DatabaseError::connection_timeout(self.acquire_timeout.as_millis() as u64)
                }
            }
            PoolError::Closed => DatabaseError::SessionClosed,
            other => DatabaseError::connection(format!("Failed to acquire connection: {}", other)),
        })
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn acquire(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(PostgresConnection {
            client: self.get().await?,
            operation_timeout: self.operation_timeout,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.pool.close();
        Ok(())
    }

    fn stats(&self) -> PoolStats {
        let status = self.pool.status();
        PoolStats {
            size: status.size,
            available: status.available,
            waiting: status.waiting,
        }
    }
}

fn convert<T, F>(value: &DatabaseValue, ty: &Type, f: F) -> Result<Param>
where
    T: ToSql + Sync + Send + 'static,
    F: FnOnce(&DatabaseValue) -> Option<T>,
{
    if value.is_null() {
        return Ok(Box::new(None::<T>));
    }
    f(value)
        .map(|v| Box::new(v) as Param)
        .ok_or_else(|| DatabaseError::type_mismatch(ty.name(), value.type_name()))
}

fn timestamp(value: &DatabaseValue) -> Option<NaiveDateTime> {
    NaiveDateTime::from_value(value.clone()).ok()
}

/// Convert an argument to the type of the parameter it binds
fn bind(value: &DatabaseValue, ty: &Type) -> Result<Param> {
    match ty.name() {
        "bool" => convert(value, ty, DatabaseValue::as_bool),
        "int2" => convert(value, ty, |v| v.as_long().and_then(|n| i16::try_from(n).ok())),
        "int4" => convert(value, ty, |v| v.as_long().and_then(|n| i32::try_from(n).ok())),
        "int8" => convert(value, ty, DatabaseValue::as_long),
        "float4" => convert(value, ty, |v| v.as_double().map(|d| d as f32)),
        "float8" => convert(value, ty, DatabaseValue::as_double),
        "bytea" => convert(value, ty, |v| v.as_bytes().map(<[u8]>::to_vec)),
        "timestamp" => convert(value, ty, timestamp),
        "timestamptz" => convert(value, ty, |v| timestamp(v).map(|t| t.and_utc())),
        _ => convert(value, ty, |v| Some(v.as_string())),
    }
}

fn bind_all(args: &[DatabaseValue], types: &[Type]) -> Result<Vec<Param>> {
    if args.len() != types.len() {
        return Err(DatabaseError::invalid_query(format!(
            "statement takes {} arguments, {} given",
            types.len(),
            args.len()
        )));
    }
    args.iter().zip(types).map(|(v, t)| bind(v, t)).collect()
}

/// Column decoded into its canonical text: numeric, uuid, json and jsonb
struct TextForm(String);

impl<'a> FromSql<'a> for TextForm {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> std::result::Result<Self, WireError> {
        let text = match ty.name() {
            "numeric" => numeric_text(raw)?,
            "uuid" => uuid_text(raw)?,
            "jsonb" => match raw.split_first() {
                Some((&1, body)) => std::str::from_utf8(body)?.to_string(),
                _ => return Err("unsupported jsonb format version".into()),
            },
            _ => std::str::from_utf8(raw)?.to_string(),
        };
        Ok(TextForm(text))
    }

    fn accepts(ty: &Type) -> bool {
        matches!(ty.name(), "numeric" | "uuid" | "json" | "jsonb")
    }
}

/// Render a binary `numeric` (base-10000 digit groups) as a decimal string
fn numeric_text(raw: &[u8]) -> std::result::Result<String, WireError> {
    let word = |i: usize| -> std::result::Result<u16, WireError> {
        raw.get(i * 2..i * 2 + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "truncated numeric value".into())
    };
    let ndigits = usize::from(word(0)?);
    let weight = i32::from(word(1)? as i16);
    let sign = word(2)?;
    let dscale = usize::from(word(3)?);
    let negative = match sign {
        0x0000 => false,
        0x4000 => true,
        0xC000 => return Ok("NaN".to_string()),
        0xD000 => return Ok("Infinity".to_string()),
        0xF000 => return Ok("-Infinity".to_string()),
        other => return Err(format!("invalid numeric sign {:#06x}", other).into()),
    };
    let digits = (0..ndigits)
        .map(|i| word(4 + i))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let group = |idx: i32| -> u16 {
        usize::try_from(idx)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&group(0).to_string());
        for idx in 1..=weight {
            out.push_str(&format!("{:04}", group(idx)));
        }
    }
    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut idx = weight + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", group(idx)));
            idx += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Ok(out)
}

fn uuid_text(raw: &[u8]) -> std::result::Result<String, WireError> {
    if raw.len() != 16 {
        return Err(format!("uuid has {} bytes, expected 16", raw.len()).into());
    }
    let hex: String = raw.iter().map(|b| format!("{:02x}", b)).collect();
    Ok(format!(
        "{}-{}-{}-{}-{}",
        &hex[..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..]
    ))
}

fn column_value(row: &Row, idx: usize, column: &Column) -> Result<DatabaseValue> {
    let ty = column.type_();
    let value = match ty.name() {
        "bool" => row.try_get::<_, Option<bool>>(idx)?.map(DatabaseValue::Bool),
        "int2" => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|v| DatabaseValue::Int(i32::from(v))),
        "int4" => row.try_get::<_, Option<i32>>(idx)?.map(DatabaseValue::Int),
        "int8" => row.try_get::<_, Option<i64>>(idx)?.map(DatabaseValue::Long),
        "oid" => row
            .try_get::<_, Option<u32>>(idx)?
            .map(|v| DatabaseValue::Long(i64::from(v))),
        "float4" => row.try_get::<_, Option<f32>>(idx)?.map(DatabaseValue::Float),
        "float8" => row.try_get::<_, Option<f64>>(idx)?.map(DatabaseValue::Double),
        "bytea" => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(DatabaseValue::Bytes),
        "timestamp" => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(DatabaseValue::Timestamp),
        "timestamptz" => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|t| DatabaseValue::Timestamp(t.naive_utc())),
        "date" => row
            .try_get::<_, Option<NaiveDate>>(idx)?
            .map(|d| DatabaseValue::String(d.to_string())),
        "time" => row
            .try_get::<_, Option<NaiveTime>>(idx)?
            .map(|t| DatabaseValue::String(t.to_string())),
        _ if TextForm::accepts(ty) => row
            .try_get::<_, Option<TextForm>>(idx)?
            .map(|t| DatabaseValue::String(t.0)),
        _ if <String as FromSql>::accepts(ty) => {
            row.try_get::<_, Option<String>>(idx)?.map(DatabaseValue::String)
        }
        other => {
            return Err(DatabaseError::mapping(
                "row",
                column.name(),
                format!("PostgreSQL type {} has no decoder", other),
            ))
        }
    };
    Ok(value.unwrap_or(DatabaseValue::Null))
}

fn decode_row(row: &Row, columns: &Arc<[String]>) -> Result<DatabaseRow> {
    let values = row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, c)| column_value(row, i, c))
        .collect::<Result<Vec<_>>>()?;
    Ok(DatabaseRow::new(columns.clone(), values))
}

/// One pooled PostgreSQL connection
pub struct PostgresConnection {
    client: Object,
    operation_timeout: Duration,
}

impl PostgresConnection {
    async fn timed<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.operation_timeout, fut)
            .await
            .map_err(|_| DatabaseError::query_timeout(self.operation_timeout.as_millis() as u64))?
    }
}

#[async_trait]
impl Connection for PostgresConnection {
    async fn execute(&mut self, stmt: &Statement) -> Result<ExecResult> {
        let sql = Dialect::Postgres.rebind(&stmt.sql);
        let client = &self.client;
        let rows_affected = self
            .timed(async {
                let prepared = client.prepare_cached(&sql).await?;
                let params = bind_all(&stmt.args, prepared.params())?;
                Ok::<_, DatabaseError>(client.execute_raw(&prepared, params).await?)
            })
            .await?;
        Ok(ExecResult {
            rows_affected,
            last_insert_id: None,
        })
    }

    async fn query(&mut self, stmt: &Statement) -> Result<Box<dyn RowStream>> {
        let sql = Dialect::Postgres.rebind(&stmt.sql);
        let client = &self.client;
        let (columns, rows) = self
            .timed(async {
                let prepared = client.prepare_cached(&sql).await?;
                let params = bind_all(&stmt.args, prepared.params())?;
                let columns: Arc<[String]> = prepared
                    .columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect();
                let rows = client.query_raw(&prepared, params).await?;
                Ok::<_, DatabaseError>((columns, rows))
            })
            .await?;
        Ok(Box::new(PostgresRowStream {
            rows: Some(Box::pin(rows)),
            columns,
            operation_timeout: self.operation_timeout,
        }))
    }

    async fn begin(&mut self) -> Result<()> {
        let client = &self.client;
        self.timed(async { Ok::<_, DatabaseError>(client.batch_execute("BEGIN").await?) })
            .await
    }

    async fn commit(&mut self) -> Result<()> {
        let client = &self.client;
        self.timed(async { Ok::<_, DatabaseError>(client.batch_execute("COMMIT").await?) })
            .await
    }

    async fn rollback(&mut self) -> Result<()> {
        let client = &self.client;
        self.timed(async { Ok::<_, DatabaseError>(client.batch_execute("ROLLBACK").await?) })
            .await
    }
}

struct PostgresRowStream {
    rows: Option<Pin<Box<tokio_postgres::RowStream>>>,
    columns: Arc<[String]>,
    operation_timeout: Duration,
}

#[async_trait]
impl RowStream for PostgresRowStream {
    async fn next_row(&mut self) -> Result<Option<DatabaseRow>> {
        let Some(rows) = self.rows.as_mut() else {
            return Ok(None);
        };
        let next = tokio::time::timeout(self.operation_timeout, rows.next())
            .await
            .map_err(|_| DatabaseError::query_timeout(self.operation_timeout.as_millis() as u64))?;
        match next {
            Some(Ok(row)) => decode_row(&row, &self.columns).map(Some),
            Some(Err(e)) => {
                self.rows = None;
                Err(e.into())
            }
            None => {
                self.rows = None;
                Ok(None)
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        // Remaining messages are discarded by the client when the stream drops.
        self.rows = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn postgres_url() -> Option<String> {
        std::env::var("POSTGRES_URL").ok()
    }

    #[test]
    fn test_bind_converts_to_parameter_type() {
        assert!(bind(&DatabaseValue::Int(7), &Type::INT8).is_ok());
        assert!(bind(&DatabaseValue::Null, &Type::INT4).is_ok());
        assert!(bind(&DatabaseValue::Long(1 << 40), &Type::INT4).is_err());
        assert!(bind(&DatabaseValue::String("x".into()), &Type::INT4).is_err());
        assert!(bind(&DatabaseValue::Long(5), &Type::TEXT).is_ok());
    }

    fn numeric(weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> Vec<u8> {
        let mut raw = Vec::new();
        for w in [digits.len() as u16, weight as u16, sign, dscale] {
            raw.extend_from_slice(&w.to_be_bytes());
        }
        for d in digits {
            raw.extend_from_slice(&d.to_be_bytes());
        }
        raw
    }

    fn text_form(ty: &Type, raw: &[u8]) -> String {
        TextForm::from_sql(ty, raw).unwrap().0
    }

    #[test]
    fn test_numeric_decodes_to_exact_text() {
        // 12345.6789
        assert_eq!(
            text_form(&Type::NUMERIC, &numeric(1, 0x0000, 4, &[1, 2345, 6789])),
            "12345.6789"
        );
        // -0.05
        assert_eq!(
            text_form(&Type::NUMERIC, &numeric(-1, 0x4000, 2, &[500])),
            "-0.05"
        );
        // 0.00005
        assert_eq!(
            text_form(&Type::NUMERIC, &numeric(-2, 0x0000, 5, &[5000])),
            "0.00005"
        );
        // 20000 (trailing zero groups are not stored)
        assert_eq!(
            text_form(&Type::NUMERIC, &numeric(1, 0x0000, 0, &[2])),
            "20000"
        );
        assert_eq!(text_form(&Type::NUMERIC, &numeric(0, 0xC000, 0, &[])), "NaN");
        assert!(TextForm::from_sql(&Type::NUMERIC, &[0, 1]).is_err());
    }

    #[test]
    fn test_uuid_and_json_decode_to_text() {
        let raw: Vec<u8> = (0u8..16).collect();
        assert_eq!(
            text_form(&Type::UUID, &raw),
            "00010203-0405-0607-0809-0a0b0c0d0e0f"
        );
        assert_eq!(text_form(&Type::JSON, br#"{"a":1}"#), r#"{"a":1}"#);
        assert_eq!(text_form(&Type::JSONB, b"\x01[1,2]"), "[1,2]");
        assert!(TextForm::from_sql(&Type::JSONB, b"\x02[]").is_err());
    }

    #[test]
    fn test_undecodable_types_are_not_accepted_as_text() {
        assert!(!TextForm::accepts(&Type::INET));
        assert!(!<String as FromSql>::accepts(&Type::INET));
        assert!(TextForm::accepts(&Type::NUMERIC));
    }

    #[test]
    fn test_bind_all_checks_arity() {
        let err = bind_all(&[DatabaseValue::Int(1)], &[]).err().unwrap();
        assert!(matches!(err, DatabaseError::InvalidQuery(_)));
    }

    #[tokio::test]
    #[ignore] // Run with: cargo test --features postgres -- --ignored
    async fn test_postgres_round_trip() -> Result<()> {
        let Some(url) = postgres_url() else {
            eprintln!("Skipping test: POSTGRES_URL not set");
            return Ok(());
        };
        let settings: ConnectionSettings = url.parse()?;
        let driver = PostgresDriver::open(&settings, &SessionOptions::default()).await?;
        let mut conn = driver.acquire().await?;

        conn.execute(&Statement::raw("DROP TABLE IF EXISTS pg_round_trip"))
            .await?;
        conn.execute(&Statement::raw(
            "CREATE TABLE pg_round_trip (id SERIAL PRIMARY KEY, name TEXT, n BIGINT)",
        ))
        .await?;
        let res = conn
            .execute(&Statement::new(
                "INSERT INTO pg_round_trip (name, n) VALUES (?, ?), (?, ?)",
                vec!["a".into(), 1.into(), "b".into(), DatabaseValue::Null],
            ))
            .await?;
        assert_eq!(res.rows_affected, 2);

        let mut stream = conn
            .query(&Statement::raw("SELECT id, name, n FROM pg_round_trip ORDER BY id"))
            .await?;
        let rows = crate::core::database::fetch_all(stream.as_mut()).await?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("n"), Some(&DatabaseValue::Long(1)));
        assert_eq!(rows[1].get("n"), Some(&DatabaseValue::Null));

        conn.execute(&Statement::raw("DROP TABLE pg_round_trip"))
            .await?;
        driver.close().await
    }
}
