//! Immutable SQL statement builders
//!
//! [`Selector`], [`Inserter`], [`Updater`] and [`Deleter`] are values. Every
//! builder method takes `&self` and returns a new value, so a base query can
//! be reused to derive any number of independent variants:
//!
//! ```
//! use rust_data_access::core::query_builder::Selector;
//! use rust_data_access::core::condition::cond;
//!
//! let base = Selector::new().from("books").order_by("title");
//! let p_only = base.and(cond("title LIKE", "P%"));
//!
//! assert_eq!(base.to_string(), "SELECT * FROM books ORDER BY title");
//! assert_eq!(
//!     p_only.to_string(),
//!     "SELECT * FROM books WHERE title LIKE ? ORDER BY title"
//! );
//! ```
//!
//! Builders obtained from a `Session`, `Tx` or `Collection` are bound to that
//! scope and can be executed; builders made with `new` only compile.

use crate::core::condition::{Condition, SqlBuf};
use crate::core::context::Context;
use crate::core::cursor::Cursor;
use crate::core::database::ExecResult;
use crate::core::dialect::{count_placeholders, Dialect};
use crate::core::error::{DatabaseError, Result};
use crate::core::mapper::{mapping, Record};
use crate::core::paginator::Paginator;
use crate::core::session::Scope;
use crate::core::statement::Statement;
use crate::core::value::DatabaseValue;
use std::fmt;

/// Identity of the session and transaction a statement belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    pub session: u64,
    pub tx: Option<u64>,
}

/// Join types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinType {
    /// Convert join type to SQL string
    pub fn as_sql(&self) -> &'static str {
        match self {
            JoinType::Inner => "JOIN",
            JoinType::Left => "LEFT JOIN",
            JoinType::Right => "RIGHT JOIN",
            JoinType::Full => "FULL JOIN",
        }
    }
}

/// Join clause
#[derive(Debug, Clone)]
pub struct Join {
    pub join_type: JoinType,
    pub table: String,
    pub on: Condition,
}

/// Order direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
enum OrderTerm {
    Column(String, OrderDirection),
    Raw(String),
}

fn owned(columns: &[&str]) -> Vec<String> {
    columns.iter().map(|c| c.to_string()).collect()
}

fn unbound() -> DatabaseError {
    DatabaseError::invalid_query(
        "statement is not bound to a session; build it from a Session, Tx or Collection",
    )
}

/// Add `scope` to the statement being compiled, rejecting foreign scopes
fn claim_scope(buf: &mut SqlBuf, scope: Option<&Scope>) -> Result<()> {
    let Some(mine) = scope.map(Scope::key) else {
        return Ok(());
    };
    match buf.scope {
        None => buf.scope = Some(mine),
        Some(outer) if outer != mine => {
            let describe = |k: ScopeKey| match k.tx {
                Some(tx) => format!("transaction {} of session {}", tx, k.session),
                None => format!("session {}", k.session),
            };
            return Err(DatabaseError::ScopeMismatch(format!(
                "subquery belongs to {} but the statement runs in {}",
                describe(mine),
                describe(outer)
            )));
        }
        Some(_) => {}
    }
    Ok(())
}

fn write_where(buf: &mut SqlBuf, keyword: &str, cond: &Option<Condition>) -> Result<()> {
    if let Some(c) = cond {
        if !c.is_empty() {
            buf.push(keyword);
            c.write_sql(buf)?;
        }
    }
    Ok(())
}

/// SELECT statement under construction
#[derive(Debug, Clone, Default)]
pub struct Selector {
    scope: Option<Scope>,
    ctx: Option<Context>,
    columns: Vec<String>,
    distinct: bool,
    table: Option<String>,
    joins: Vec<Join>,
    where_: Option<Condition>,
    group_by: Vec<String>,
    having: Option<Condition>,
    order_by: Vec<OrderTerm>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl Selector {
    /// Unbound selector, usable as a subquery or for inspection
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bound(scope: Scope) -> Self {
        Self {
            scope: Some(scope),
            ..Self::default()
        }
    }

    fn with(&self, f: impl FnOnce(&mut Selector)) -> Selector {
        let mut next = self.clone();
        f(&mut next);
        next
    }

    /// Replace the projection; raw expressions and aliases pass through
    #[must_use]
    pub fn columns(&self, columns: &[&str]) -> Selector {
        self.with(|s| s.columns = owned(columns))
    }

    #[must_use]
    pub fn distinct(&self) -> Selector {
        self.with(|s| s.distinct = true)
    }

    #[must_use]
    pub fn from(&self, table: &str) -> Selector {
        self.with(|s| s.table = Some(table.to_string()))
    }

    #[must_use]
    pub fn join(&self, table: &str, on: Condition) -> Selector {
        self.join_as(JoinType::Inner, table, on)
    }

    #[must_use]
    pub fn left_join(&self, table: &str, on: Condition) -> Selector {
        self.join_as(JoinType::Left, table, on)
    }

    /// Join of an explicit type; joins compose left to right
    #[must_use]
    pub fn join_as(&self, join_type: JoinType, table: &str, on: Condition) -> Selector {
        self.with(|s| {
            s.joins.push(Join {
                join_type,
                table: table.to_string(),
                on,
            })
        })
    }

    /// Replace the WHERE condition
    #[must_use]
    pub fn where_(&self, condition: Condition) -> Selector {
        self.with(|s| s.where_ = Some(condition))
    }

    /// Narrow the WHERE condition by conjunction
    #[must_use]
    pub fn and(&self, condition: Condition) -> Selector {
        self.with(|s| {
            s.where_ = Some(match s.where_.take() {
                Some(existing) => existing.and(condition),
                None => condition,
            })
        })
    }

    /// Widen the WHERE condition by disjunction
    #[must_use]
    pub fn or(&self, condition: Condition) -> Selector {
        self.with(|s| {
            s.where_ = Some(match s.where_.take() {
                Some(existing) => existing.or(condition),
                None => condition,
            })
        })
    }

    #[must_use]
    pub fn group_by(&self, columns: &[&str]) -> Selector {
        self.with(|s| s.group_by.extend(columns.iter().map(|c| c.to_string())))
    }

    #[must_use]
    pub fn having(&self, condition: Condition) -> Selector {
        self.with(|s| s.having = Some(condition))
    }

    /// Append an ordering key.
    ///
    /// A leading `-` sorts descending (`"-title"`); a trailing `ASC`/`DESC` is
    /// honored too. Column names are not validated here.
    #[must_use]
    pub fn order_by(&self, key: &str) -> Selector {
        let key = key.trim();
        let (column, dir) = if let Some(col) = key.strip_prefix('-') {
            (col.trim(), OrderDirection::Desc)
        } else {
            match key.rsplit_once(char::is_whitespace) {
                Some((col, d)) if d.eq_ignore_ascii_case("desc") => {
                    (col.trim(), OrderDirection::Desc)
                }
                Some((col, d)) if d.eq_ignore_ascii_case("asc") => (col.trim(), OrderDirection::Asc),
                _ => (key, OrderDirection::Asc),
            }
        };
        self.order_by_dir(column, dir)
    }

    #[must_use]
    pub fn order_by_dir(&self, column: &str, direction: OrderDirection) -> Selector {
        self.with(|s| {
            s.order_by
                .push(OrderTerm::Column(column.to_string(), direction))
        })
    }

    /// Append a raw ordering expression such as `RANDOM()`
    #[must_use]
    pub fn order_by_raw(&self, expr: &str) -> Selector {
        self.with(|s| s.order_by.push(OrderTerm::Raw(expr.to_string())))
    }

    #[must_use]
    pub fn limit(&self, n: u64) -> Selector {
        self.with(|s| s.limit = Some(n))
    }

    #[must_use]
    pub fn offset(&self, n: u64) -> Selector {
        self.with(|s| s.offset = Some(n))
    }

    /// Run terminal operations of this selector under `ctx`
    #[must_use]
    pub fn with_context(&self, ctx: Context) -> Selector {
        self.with(|s| s.ctx = Some(ctx))
    }

    /// Whether an ORDER BY has been set
    pub fn is_ordered(&self) -> bool {
        !self.order_by.is_empty()
    }

    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    fn target(&self) -> String {
        self.table.clone().unwrap_or_else(|| "query".to_string())
    }

    fn dialect(&self) -> Dialect {
        self.scope
            .as_ref()
            .map_or(Dialect::Sqlite, Scope::dialect)
    }

    fn context(&self, scope: &Scope) -> Context {
        self.ctx
            .clone()
            .unwrap_or_else(|| scope.default_context())
    }

    fn require_scope(&self) -> Result<&Scope> {
        self.scope.as_ref().ok_or_else(unbound)
    }

    pub(crate) fn write_select(&self, buf: &mut SqlBuf) -> Result<()> {
        claim_scope(buf, self.scope.as_ref())?;
        buf.push("SELECT ");
        if self.distinct {
            buf.push("DISTINCT ");
        }
        if self.columns.is_empty() {
            buf.push("*");
        } else {
            buf.push(&self.columns.join(", "));
        }
        if let Some(table) = &self.table {
            buf.push(" FROM ");
            buf.push(table);
        }
        for join in &self.joins {
            buf.push(" ");
            buf.push(join.join_type.as_sql());
            buf.push(" ");
            buf.push(&join.table);
            if !join.on.is_empty() {
                buf.push(" ON ");
                join.on.write_sql(buf)?;
            }
        }
        write_where(buf, " WHERE ", &self.where_)?;
        if !self.group_by.is_empty() {
            buf.push(" GROUP BY ");
            buf.push(&self.group_by.join(", "));
        }
        write_where(buf, " HAVING ", &self.having)?;
        if !self.order_by.is_empty() {
            let terms: Vec<String> = self
                .order_by
                .iter()
                .map(|t| match t {
                    OrderTerm::Column(c, OrderDirection::Asc) => c.clone(),
                    OrderTerm::Column(c, OrderDirection::Desc) => format!("{} DESC", c),
                    OrderTerm::Raw(r) => r.clone(),
                })
                .collect();
            buf.push(" ORDER BY ");
            buf.push(&terms.join(", "));
        }
        match (self.limit, self.offset) {
            (Some(l), Some(o)) => buf.push(&format!(" LIMIT {} OFFSET {}", l, o)),
            (Some(l), None) => buf.push(&format!(" LIMIT {}", l)),
            (None, Some(o)) => buf.push(&format!(" LIMIT {} OFFSET {}", buf.dialect.no_limit(), o)),
            (None, None) => {}
        }
        Ok(())
    }

    fn build(&self, dialect: Dialect) -> Result<Statement> {
        let mut buf = SqlBuf::new(self.scope.as_ref().map(Scope::key), dialect);
        self.write_select(&mut buf)?;
        Ok(Statement::new(buf.sql, buf.args))
    }

    /// Statement with `?` placeholders
    pub fn to_statement(&self) -> Result<Statement> {
        self.build(self.dialect())
    }

    /// Statement in the native placeholder form of `dialect`
    pub fn compile(&self, dialect: Dialect) -> Result<Statement> {
        Ok(self.build(dialect)?.rebind(dialect))
    }

    /// Counting variant: same joins and predicates, no projection or paging
    pub fn count_statement(&self) -> Result<Statement> {
        let base = self.with(|s| {
            s.order_by.clear();
            s.limit = None;
            s.offset = None;
        });
        if base.distinct || !base.group_by.is_empty() {
            let inner = base.build(self.dialect())?;
            return Ok(Statement::new(
                format!("SELECT COUNT(1) AS _t FROM ({}) AS _q", inner.sql),
                inner.args,
            ));
        }
        base.with(|s| s.columns = vec!["COUNT(1) AS _t".to_string()])
            .build(self.dialect())
    }

    /// Start the query and return a cursor over its rows
    pub async fn cursor(&self) -> Result<Cursor> {
        let scope = self.require_scope()?;
        let stmt = self.to_statement()?;
        scope
            .open_cursor(self.context(scope), stmt, self.target(), Some(self.clone()))
            .await
    }

    /// Every matching record
    pub async fn all<T: Record>(&self) -> Result<Vec<T>> {
        let mut cursor = self.cursor().await?;
        let mut out = Vec::new();
        cursor.all(&mut out).await?;
        Ok(out)
    }

    /// The first matching record
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when nothing matches.
    pub async fn one<T: Record>(&self) -> Result<T> {
        let mut cursor = self.limit(1).cursor().await?;
        let row = cursor.next_row().await;
        cursor.close().await?;
        match row? {
            Some(row) => mapping::<T>()?.decode(&row),
            None => Err(DatabaseError::not_found(self.target())),
        }
    }

    /// Number of matching rows, ignoring projection, ordering and paging
    pub async fn count(&self) -> Result<u64> {
        let scope = self.require_scope()?;
        let stmt = self.count_statement()?;
        let target = self.target();
        let rows = scope
            .fetch_rows(&self.context(scope), &stmt, "count", &target)
            .await?;
        let n = rows
            .first()
            .and_then(|r| r.get_index(0))
            .and_then(DatabaseValue::as_long)
            .ok_or_else(|| DatabaseError::mapping("count", "_t", "expected an integer"))?;
        Ok(n.max(0) as u64)
    }

    /// Whether any row matches
    pub async fn exists(&self) -> Result<bool> {
        Ok(self.count().await? > 0)
    }

    fn single_table(&self, op: &str) -> Result<(&Scope, &str)> {
        let scope = self.require_scope()?;
        let table = self
            .table
            .as_deref()
            .ok_or_else(|| DatabaseError::invalid_query(format!("{} needs a FROM table", op)))?;
        if !self.joins.is_empty() || !self.group_by.is_empty() {
            return Err(DatabaseError::invalid_query(format!(
                "{} applies to a single table; joins and grouping are not allowed",
                op
            )));
        }
        Ok((scope, table))
    }

    /// Update every matching row with the record's fields
    ///
    /// Ordering and paging are ignored; the WHERE condition selects the rows.
    pub async fn update<T: Record>(&self, record: &T) -> Result<ExecResult> {
        let (scope, table) = self.single_table("update")?;
        let mut updater = Updater::bound(scope.clone(), table)
            .with_context(self.context(scope))
            .set_record(record)?;
        if let Some(c) = &self.where_ {
            updater = updater.where_(c.clone());
        }
        updater.exec().await
    }

    /// Delete every matching row
    pub async fn delete(&self) -> Result<ExecResult> {
        let (scope, table) = self.single_table("delete")?;
        let mut deleter = Deleter::bound(scope.clone(), table).with_context(self.context(scope));
        if let Some(c) = &self.where_ {
            deleter = deleter.where_(c.clone());
        }
        deleter.exec().await
    }

    /// Page-indexed view of this query
    ///
    /// # Errors
    ///
    /// Returns `InvalidQuery` when no ORDER BY is set or `page_size` is zero.
    pub fn paginate(&self, page_size: u64) -> Result<Paginator> {
        Paginator::new(self.clone(), page_size)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_statement() {
            Ok(stmt) => f.write_str(&stmt.sql),
            Err(e) => write!(f, "<invalid statement: {}>", e),
        }
    }
}

/// INSERT statement under construction
#[derive(Debug, Clone)]
pub struct Inserter {
    scope: Option<Scope>,
    ctx: Option<Context>,
    table: String,
    columns: Vec<String>,
    rows: Vec<Vec<DatabaseValue>>,
    returning: Vec<String>,
}

impl Inserter {
    /// Unbound inserter
    pub fn new(table: &str) -> Self {
        Self {
            scope: None,
            ctx: None,
            table: table.to_string(),
            columns: Vec::new(),
            rows: Vec::new(),
            returning: Vec::new(),
        }
    }

    pub(crate) fn bound(scope: Scope, table: &str) -> Self {
        Self {
            scope: Some(scope),
            ..Self::new(table)
        }
    }

    fn with(&self, f: impl FnOnce(&mut Inserter)) -> Inserter {
        let mut next = self.clone();
        f(&mut next);
        next
    }

    #[must_use]
    pub fn columns(&self, columns: &[&str]) -> Inserter {
        self.with(|s| s.columns = owned(columns))
    }

    /// Append one row of values
    #[must_use]
    pub fn values(&self, values: Vec<DatabaseValue>) -> Inserter {
        self.with(|s| s.rows.push(values))
    }

    /// Append a record as one row.
    ///
    /// The first record fixes the column list; later records must encode to
    /// the same columns.
    pub fn values_record<T: Record>(&self, record: &T) -> Result<Inserter> {
        let pairs = mapping::<T>()?.encode(record);
        let (cols, values): (Vec<String>, Vec<DatabaseValue>) = pairs.into_iter().unzip();
        if self.columns.is_empty() && self.rows.is_empty() {
            return Ok(self.with(|s| {
                s.columns = cols;
                s.rows.push(values);
            }));
        }
        if cols != self.columns {
            return Err(DatabaseError::invalid_query(format!(
                "record encodes columns ({}) but the insert has ({})",
                cols.join(", "),
                self.columns.join(", ")
            )));
        }
        Ok(self.values(values))
    }

    /// Columns returned by the insert; read them with [`Inserter::query`]
    #[must_use]
    pub fn returning(&self, columns: &[&str]) -> Inserter {
        self.with(|s| s.returning = owned(columns))
    }

    #[must_use]
    pub fn with_context(&self, ctx: Context) -> Inserter {
        self.with(|s| s.ctx = Some(ctx))
    }

    /// Statement with `?` placeholders
    pub fn to_statement(&self) -> Result<Statement> {
        let mut buf = SqlBuf::new(
            self.scope.as_ref().map(Scope::key),
            self.scope.as_ref().map_or(Dialect::Sqlite, Scope::dialect),
        );
        buf.push("INSERT INTO ");
        buf.push(&self.table);
        if !self.columns.is_empty() {
            buf.push(" (");
            buf.push(&self.columns.join(", "));
            buf.push(")");
        }
        if self.rows.is_empty() {
            buf.push(" DEFAULT VALUES");
        } else {
            let width = if self.columns.is_empty() {
                self.rows[0].len()
            } else {
                self.columns.len()
            };
            buf.push(" VALUES ");
            for (i, row) in self.rows.iter().enumerate() {
                if row.len() != width {
                    return Err(DatabaseError::invalid_query(format!(
                        "insert row {} has {} values, expected {}",
                        i,
                        row.len(),
                        width
                    )));
                }
                if i > 0 {
                    buf.push(", ");
                }
                buf.push("(");
                buf.push(&vec!["?"; width].join(", "));
                buf.push(")");
                buf.args.extend(row.iter().cloned());
            }
        }
        if !self.returning.is_empty() {
            buf.push(" RETURNING ");
            buf.push(&self.returning.join(", "));
        }
        Ok(Statement::new(buf.sql, buf.args))
    }

    pub fn compile(&self, dialect: Dialect) -> Result<Statement> {
        Ok(self.to_statement()?.rebind(dialect))
    }

    fn scope_and_context(&self) -> Result<(&Scope, Context)> {
        let scope = self.scope.as_ref().ok_or_else(unbound)?;
        let ctx = self.ctx.clone().unwrap_or_else(|| scope.default_context());
        Ok((scope, ctx))
    }

    /// Execute the insert
    pub async fn exec(&self) -> Result<ExecResult> {
        let (scope, ctx) = self.scope_and_context()?;
        let stmt = self.to_statement()?;
        scope.execute(&ctx, &stmt, "insert", &self.table).await
    }

    /// Execute the insert and read the RETURNING rows
    pub async fn query(&self) -> Result<Cursor> {
        let (scope, ctx) = self.scope_and_context()?;
        let stmt = self.to_statement()?;
        scope.open_cursor(ctx, stmt, self.table.clone(), None).await
    }
}

impl fmt::Display for Inserter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_statement() {
            Ok(stmt) => f.write_str(&stmt.sql),
            Err(e) => write!(f, "<invalid statement: {}>", e),
        }
    }
}

#[derive(Debug, Clone)]
enum SetClause {
    Value(String, DatabaseValue),
    Raw(String, Vec<DatabaseValue>),
}

/// UPDATE statement under construction
#[derive(Debug, Clone)]
pub struct Updater {
    scope: Option<Scope>,
    ctx: Option<Context>,
    table: String,
    sets: Vec<SetClause>,
    where_: Option<Condition>,
}

impl Updater {
    /// Unbound updater
    pub fn new(table: &str) -> Self {
        Self {
            scope: None,
            ctx: None,
            table: table.to_string(),
            sets: Vec::new(),
            where_: None,
        }
    }

    pub(crate) fn bound(scope: Scope, table: &str) -> Self {
        Self {
            scope: Some(scope),
            ..Self::new(table)
        }
    }

    fn with(&self, f: impl FnOnce(&mut Updater)) -> Updater {
        let mut next = self.clone();
        f(&mut next);
        next
    }

    /// `column = ?`
    #[must_use]
    pub fn set(&self, column: &str, value: impl Into<DatabaseValue>) -> Updater {
        let value = value.into();
        self.with(|s| s.sets.push(SetClause::Value(column.to_string(), value)))
    }

    /// Raw assignment such as `"first_name = ?"` with its arguments
    #[must_use]
    pub fn set_raw(&self, text: &str, args: Vec<DatabaseValue>) -> Updater {
        self.with(|s| s.sets.push(SetClause::Raw(text.to_string(), args)))
    }

    /// Assign every encoded field of a record
    pub fn set_record<T: Record>(&self, record: &T) -> Result<Updater> {
        let pairs = mapping::<T>()?.encode(record);
        Ok(self.with(|s| {
            s.sets
                .extend(pairs.into_iter().map(|(c, v)| SetClause::Value(c, v)))
        }))
    }

    #[must_use]
    pub fn where_(&self, condition: Condition) -> Updater {
        self.with(|s| s.where_ = Some(condition))
    }

    #[must_use]
    pub fn and(&self, condition: Condition) -> Updater {
        self.with(|s| {
            s.where_ = Some(match s.where_.take() {
                Some(existing) => existing.and(condition),
                None => condition,
            })
        })
    }

    #[must_use]
    pub fn with_context(&self, ctx: Context) -> Updater {
        self.with(|s| s.ctx = Some(ctx))
    }

    /// Statement with `?` placeholders
    pub fn to_statement(&self) -> Result<Statement> {
        if self.sets.is_empty() {
            return Err(DatabaseError::invalid_query(format!(
                "update of {} sets no columns",
                self.table
            )));
        }
        let mut buf = SqlBuf::new(
            self.scope.as_ref().map(Scope::key),
            self.scope.as_ref().map_or(Dialect::Sqlite, Scope::dialect),
        );
        buf.push("UPDATE ");
        buf.push(&self.table);
        buf.push(" SET ");
        for (i, set) in self.sets.iter().enumerate() {
            if i > 0 {
                buf.push(", ");
            }
            match set {
                SetClause::Value(column, value) => {
                    buf.push(column);
                    buf.push(" = ?");
                    buf.args.push(value.clone());
                }
                SetClause::Raw(text, args) => {
                    if count_placeholders(text) != args.len() {
                        return Err(DatabaseError::invalid_query(format!(
                            "assignment '{}' does not match its {} arguments",
                            text,
                            args.len()
                        )));
                    }
                    buf.push(text);
                    buf.args.extend(args.iter().cloned());
                }
            }
        }
        write_where(&mut buf, " WHERE ", &self.where_)?;
        Ok(Statement::new(buf.sql, buf.args))
    }

    pub fn compile(&self, dialect: Dialect) -> Result<Statement> {
        Ok(self.to_statement()?.rebind(dialect))
    }

    /// Execute the update
    pub async fn exec(&self) -> Result<ExecResult> {
        let scope = self.scope.as_ref().ok_or_else(unbound)?;
        let ctx = self.ctx.clone().unwrap_or_else(|| scope.default_context());
        let stmt = self.to_statement()?;
        scope.execute(&ctx, &stmt, "update", &self.table).await
    }
}

impl fmt::Display for Updater {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_statement() {
            Ok(stmt) => f.write_str(&stmt.sql),
            Err(e) => write!(f, "<invalid statement: {}>", e),
        }
    }
}

/// DELETE statement under construction
#[derive(Debug, Clone)]
pub struct Deleter {
    scope: Option<Scope>,
    ctx: Option<Context>,
    table: String,
    where_: Option<Condition>,
}

impl Deleter {
    /// Unbound deleter
    pub fn new(table: &str) -> Self {
        Self {
            scope: None,
            ctx: None,
            table: table.to_string(),
            where_: None,
        }
    }

    pub(crate) fn bound(scope: Scope, table: &str) -> Self {
        Self {
            scope: Some(scope),
            ..Self::new(table)
        }
    }

    fn with(&self, f: impl FnOnce(&mut Deleter)) -> Deleter {
        let mut next = self.clone();
        f(&mut next);
        next
    }

    #[must_use]
    pub fn where_(&self, condition: Condition) -> Deleter {
        self.with(|s| s.where_ = Some(condition))
    }

    #[must_use]
    pub fn and(&self, condition: Condition) -> Deleter {
        self.with(|s| {
            s.where_ = Some(match s.where_.take() {
                Some(existing) => existing.and(condition),
                None => condition,
            })
        })
    }

    #[must_use]
    pub fn with_context(&self, ctx: Context) -> Deleter {
        self.with(|s| s.ctx = Some(ctx))
    }

    /// Statement with `?` placeholders
    pub fn to_statement(&self) -> Result<Statement> {
        let mut buf = SqlBuf::new(
            self.scope.as_ref().map(Scope::key),
            self.scope.as_ref().map_or(Dialect::Sqlite, Scope::dialect),
        );
        buf.push("DELETE FROM ");
        buf.push(&self.table);
        write_where(&mut buf, " WHERE ", &self.where_)?;
        Ok(Statement::new(buf.sql, buf.args))
    }

    pub fn compile(&self, dialect: Dialect) -> Result<Statement> {
        Ok(self.to_statement()?.rebind(dialect))
    }

    /// Execute the delete
    pub async fn exec(&self) -> Result<ExecResult> {
        let scope = self.scope.as_ref().ok_or_else(unbound)?;
        let ctx = self.ctx.clone().unwrap_or_else(|| scope.default_context());
        let stmt = self.to_statement()?;
        scope.execute(&ctx, &stmt, "delete", &self.table).await
    }
}

impl fmt::Display for Deleter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_statement() {
            Ok(stmt) => f.write_str(&stmt.sql),
            Err(e) => write!(f, "<invalid statement: {}>", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::condition::cond;

    #[test]
    fn test_select_builder() {
        let q = Selector::new()
            .columns(&["id", "title"])
            .from("books")
            .where_(cond("author_id", 4156))
            .order_by("-title")
            .limit(10)
            .offset(20);
        let stmt = q.to_statement().unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT id, title FROM books WHERE author_id = ? ORDER BY title DESC LIMIT 10 OFFSET 20"
        );
        assert_eq!(stmt.args, vec![DatabaseValue::Int(4156)]);
    }

    #[test]
    fn test_builder_is_immutable() {
        let base = Selector::new().from("books").order_by("title");
        let narrowed = base.and(cond("title LIKE", "P%"));
        let limited = base.limit(1);
        assert_eq!(base.to_string(), "SELECT * FROM books ORDER BY title");
        assert_eq!(
            narrowed.to_string(),
            "SELECT * FROM books WHERE title LIKE ? ORDER BY title"
        );
        assert_eq!(limited.to_string(), "SELECT * FROM books ORDER BY title LIMIT 1");
    }

    #[test]
    fn test_join_with_alias() {
        let q = Selector::new()
            .columns(&["b.id AS book_id", "*"])
            .from("books AS b")
            .join("subjects AS s", Condition::raw("b.subject_id = s.id"))
            .where_(cond("s.location", "Main St"))
            .order_by("b.title");
        assert_eq!(
            q.to_string(),
            "SELECT b.id AS book_id, * FROM books AS b JOIN subjects AS s ON b.subject_id = s.id \
             WHERE s.location = ? ORDER BY b.title"
        );
    }

    #[test]
    fn test_order_by_forms() {
        let q = Selector::new()
            .from("t")
            .order_by("a DESC")
            .order_by("b asc")
            .order_by_raw("RANDOM()");
        assert_eq!(q.to_string(), "SELECT * FROM t ORDER BY a DESC, b, RANDOM()");
    }

    #[test]
    fn test_offset_without_limit() {
        let q = Selector::new().from("t").offset(5);
        assert_eq!(q.to_string(), "SELECT * FROM t LIMIT -1 OFFSET 5");
        let pg = q.compile(Dialect::Postgres).unwrap();
        assert_eq!(pg.sql, "SELECT * FROM t LIMIT ALL OFFSET 5");
    }

    #[test]
    fn test_count_statement() {
        let q = Selector::new()
            .columns(&["title"])
            .from("books")
            .where_(cond("author_id", 1))
            .order_by("title")
            .limit(3);
        let c = q.count_statement().unwrap();
        assert_eq!(c.sql, "SELECT COUNT(1) AS _t FROM books WHERE author_id = ?");
        assert_eq!(c.args.len(), 1);

        let grouped = Selector::new()
            .columns(&["author_id"])
            .from("books")
            .group_by(&["author_id"]);
        assert_eq!(
            grouped.count_statement().unwrap().sql,
            "SELECT COUNT(1) AS _t FROM (SELECT author_id FROM books GROUP BY author_id) AS _q"
        );
    }

    #[test]
    fn test_postgres_placeholders() {
        let q = Selector::new()
            .from("books")
            .where_(cond("id >", 1))
            .and(Condition::is_in("author_id", [2, 3]));
        assert_eq!(
            q.compile(Dialect::Postgres).unwrap().sql,
            "SELECT * FROM books WHERE id > $1 AND author_id IN ($2, $3)"
        );
    }

    #[test]
    fn test_subquery() {
        let sub = Selector::new().columns(&["id"]).from("authors").where_(cond("last_name", "Poe"));
        let q = Selector::new()
            .from("books")
            .where_(Condition::in_subquery("author_id", &sub))
            .and(cond("id >", 5));
        let stmt = q.to_statement().unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT * FROM books WHERE author_id IN (SELECT id FROM authors WHERE last_name = ?) AND id > ?"
        );
        assert_eq!(stmt.args.len(), 2);
    }

    #[test]
    fn test_insert_builder() {
        let ins = Inserter::new("books")
            .columns(&["title", "author_id"])
            .values(vec!["Dune".into(), 1.into()])
            .values(vec!["Emma".into(), 2.into()])
            .returning(&["id"]);
        let stmt = ins.to_statement().unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO books (title, author_id) VALUES (?, ?), (?, ?) RETURNING id"
        );
        assert_eq!(stmt.args.len(), 4);

        let bad = Inserter::new("books")
            .columns(&["title"])
            .values(vec!["a".into(), "b".into()]);
        assert!(bad.to_statement().is_err());

        assert_eq!(
            Inserter::new("books").to_string(),
            "INSERT INTO books DEFAULT VALUES"
        );
    }

    #[test]
    fn test_update_builder() {
        let upd = Updater::new("authors")
            .set_raw("first_name = ?", vec!["Edgar".into()])
            .set("last_name", "Poe")
            .where_(cond("id", 7));
        let stmt = upd.to_statement().unwrap();
        assert_eq!(
            stmt.sql,
            "UPDATE authors SET first_name = ?, last_name = ? WHERE id = ?"
        );
        assert_eq!(stmt.args.len(), 3);
        assert!(Updater::new("authors").to_statement().is_err());
        assert!(Updater::new("a")
            .set_raw("x = ? + ?", vec![1.into()])
            .to_statement()
            .is_err());
    }

    #[test]
    fn test_delete_builder() {
        let del = Deleter::new("books").where_(cond("title", "The Crow"));
        assert_eq!(del.to_string(), "DELETE FROM books WHERE title = ?");
        assert_eq!(Deleter::new("books").to_string(), "DELETE FROM books");
    }

    #[test]
    fn test_paginate_requires_order() {
        let q = Selector::new().from("books");
        assert!(matches!(
            q.paginate(10),
            Err(DatabaseError::InvalidQuery(_))
        ));
        assert!(q.order_by("id").paginate(10).is_ok());
    }

    #[tokio::test]
    async fn test_unbound_cannot_execute() {
        let q = Selector::new().from("books");
        assert!(matches!(q.count().await, Err(DatabaseError::InvalidQuery(_))));
        assert!(Deleter::new("books").exec().await.is_err());
    }
}
