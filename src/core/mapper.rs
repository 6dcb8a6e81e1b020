//! Record to row mapping
//!
//! A record type declares its columns once, in [`Record::describe`], using the
//! tag grammar `name[,option...]` with the options `omitempty`, `-` (ignore)
//! and `inline`. The declaration is turned into a [`FieldMapping`]: an ordered
//! table of column descriptors, each holding a getter/setter pair. Mappings are
//! built on first use and cached for the life of the process.
//!
//! Inline fields contribute the nested record's columns to the parent's
//! column set, recursively, so one composite type can hold a join result:
//!
//! ```
//! use rust_data_access::core::mapper::{mapping, MappingBuilder, Record};
//!
//! #[derive(Debug, Default, Clone, PartialEq)]
//! struct Book { id: i64, title: String }
//! #[derive(Debug, Default, Clone, PartialEq)]
//! struct Subject { subject: String }
//! #[derive(Debug, Default, Clone, PartialEq)]
//! struct BookSubject { book_id: i64, book: Book, subject: Subject }
//!
//! impl Record for Book {
//!     fn describe(m: &mut MappingBuilder<Self>) {
//!         m.field("id,omitempty", |r| &r.id, |r| &mut r.id)
//!             .field("title", |r| &r.title, |r| &mut r.title);
//!     }
//! }
//! impl Record for Subject {
//!     fn describe(m: &mut MappingBuilder<Self>) {
//!         m.field("subject", |r| &r.subject, |r| &mut r.subject);
//!     }
//! }
//! impl Record for BookSubject {
//!     fn describe(m: &mut MappingBuilder<Self>) {
//!         m.field("book_id", |r| &r.book_id, |r| &mut r.book_id)
//!             .inline(",inline", |r| &r.book, |r| &mut r.book)
//!             .inline(",inline", |r| &r.subject, |r| &mut r.subject);
//!     }
//! }
//!
//! let m = mapping::<BookSubject>().unwrap();
//! assert_eq!(m.columns().collect::<Vec<_>>(), ["book_id", "id", "title", "subject"]);
//! ```
//!
//! Column names are not disambiguated automatically. When two inlined members
//! share a column name the first declaration wins, the name is reported by
//! [`FieldMapping::ambiguous_columns`], and the caller is expected to alias
//! the column in the projection (`SELECT b.id AS book_id, ...`).

use crate::core::error::{DatabaseError, Result};
use crate::core::value::{ColumnValue, DatabaseRow, DatabaseValue};
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// A type that maps onto table rows
pub trait Record: Default + Send + Sync + 'static {
    /// Declare the column mapping of this type
    fn describe(m: &mut MappingBuilder<Self>);
}

/// Options parsed from a mapping tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldOptions {
    pub omit_empty: bool,
    pub ignore: bool,
    pub inline: bool,
}

/// Parsed `name[,option...]` tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldTag {
    pub name: String,
    pub options: FieldOptions,
}

impl FieldTag {
    /// Parse a mapping tag
    ///
    /// # Errors
    ///
    /// Returns `Mapping` for unknown options or a missing column name.
    pub fn parse(tag: &str) -> Result<Self> {
        let mut parts = tag.split(',').map(str::trim);
        let name = parts.next().unwrap_or_default().to_string();
        let mut options = FieldOptions::default();
        if name == "-" {
            options.ignore = true;
        }
        for opt in parts {
            match opt {
                "omitempty" => options.omit_empty = true,
                "inline" => options.inline = true,
                "-" => options.ignore = true,
                "" => {}
                other => {
                    return Err(DatabaseError::mapping(
                        "tag",
                        tag,
                        format!("unknown option '{}'", other),
                    ))
                }
            }
        }
        if name.is_empty() && !options.inline && !options.ignore {
            return Err(DatabaseError::mapping("tag", tag, "missing column name"));
        }
        Ok(Self { name, options })
    }
}

type Getter<T> = Arc<dyn Fn(&T) -> DatabaseValue + Send + Sync>;
type Setter<T> = Arc<dyn Fn(&mut T, DatabaseValue) -> Result<()> + Send + Sync>;
type EmptyTest<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// One mapped column of a record type
pub struct FieldDescriptor<T> {
    column: String,
    omit_empty: bool,
    nullable: bool,
    get: Getter<T>,
    set: Setter<T>,
    is_empty: EmptyTest<T>,
}

impl<T> Clone for FieldDescriptor<T> {
    fn clone(&self) -> Self {
        Self {
            column: self.column.clone(),
            omit_empty: self.omit_empty,
            nullable: self.nullable,
            get: self.get.clone(),
            set: self.set.clone(),
            is_empty: self.is_empty.clone(),
        }
    }
}

impl<T> fmt::Debug for FieldDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("column", &self.column)
            .field("omit_empty", &self.omit_empty)
            .field("nullable", &self.nullable)
            .finish()
    }
}

impl<T> FieldDescriptor<T> {
    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn omit_empty(&self) -> bool {
        self.omit_empty
    }

    pub fn nullable(&self) -> bool {
        self.nullable
    }

    /// Nest this descriptor under a parent that reaches `T` through `proj`
    fn lift<P: 'static>(&self, proj: fn(&P) -> &T, proj_mut: fn(&mut P) -> &mut T) -> FieldDescriptor<P>
    where
        T: 'static,
    {
        let get = self.get.clone();
        let set = self.set.clone();
        let is_empty = self.is_empty.clone();
        FieldDescriptor {
            column: self.column.clone(),
            omit_empty: self.omit_empty,
            nullable: self.nullable,
            get: Arc::new(move |p: &P| get(proj(p))),
            set: Arc::new(move |p: &mut P, v: DatabaseValue| set(proj_mut(p), v)),
            is_empty: Arc::new(move |p: &P| is_empty(proj(p))),
        }
    }
}

/// Collects the declarations of one record type
pub struct MappingBuilder<T> {
    fields: Vec<FieldDescriptor<T>>,
    strict: bool,
    error: Option<DatabaseError>,
}

impl<T: Record> MappingBuilder<T> {
    fn new() -> Self {
        Self {
            fields: Vec::new(),
            strict: false,
            error: None,
        }
    }

    fn fail(&mut self, err: DatabaseError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// Map a field to a column
    pub fn field<V: ColumnValue>(
        &mut self,
        tag: &str,
        get: fn(&T) -> &V,
        get_mut: fn(&mut T) -> &mut V,
    ) -> &mut Self {
        let tag = match FieldTag::parse(tag) {
            Ok(t) => t,
            Err(e) => {
                self.fail(e);
                return self;
            }
        };
        if tag.options.ignore {
            return self;
        }
        if tag.options.inline {
            self.fail(DatabaseError::mapping(
                record_name::<T>(),
                tag.name,
                "inline requires a record field; use MappingBuilder::inline",
            ));
            return self;
        }
        self.fields.push(FieldDescriptor {
            column: tag.name,
            omit_empty: tag.options.omit_empty,
            nullable: V::NULLABLE,
            get: Arc::new(move |r: &T| get(r).to_value()),
            set: Arc::new(move |r: &mut T, v: DatabaseValue| -> Result<()> {
                *get_mut(r) = V::from_value(v)?;
                Ok(())
            }),
            is_empty: Arc::new(move |r: &T| get(r).is_empty_value()),
        });
        self
    }

    /// Flatten a nested record's columns into this record
    pub fn inline<U: Record>(
        &mut self,
        tag: &str,
        get: fn(&T) -> &U,
        get_mut: fn(&mut T) -> &mut U,
    ) -> &mut Self {
        match FieldTag::parse(tag) {
            Ok(t) if t.options.ignore => return self,
            Ok(t) if !t.options.inline => {
                self.fail(DatabaseError::mapping(
                    record_name::<T>(),
                    t.name,
                    "nested record field must be tagged inline",
                ));
                return self;
            }
            Ok(_) => {}
            Err(e) => {
                self.fail(e);
                return self;
            }
        }
        if TypeId::of::<U>() == TypeId::of::<T>() {
            self.fail(DatabaseError::mapping(
                record_name::<T>(),
                tag,
                "a record cannot inline itself",
            ));
            return self;
        }
        match mapping::<U>() {
            Ok(nested) => {
                for d in &nested.fields {
                    self.fields.push(d.lift(get, get_mut));
                }
            }
            Err(e) => self.fail(e),
        }
        self
    }

    /// Reject row columns that no field maps
    pub fn strict(&mut self) -> &mut Self {
        self.strict = true;
        self
    }

    fn finish(self) -> Result<FieldMapping<T>> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let mut index = HashMap::with_capacity(self.fields.len());
        let mut ambiguous = Vec::new();
        for (i, d) in self.fields.iter().enumerate() {
            if index.contains_key(&d.column) {
                if !ambiguous.contains(&d.column) {
                    ambiguous.push(d.column.clone());
                }
            } else {
                index.insert(d.column.clone(), i);
            }
        }
        if !ambiguous.is_empty() {
            tracing::warn!(
                record = record_name::<T>(),
                columns = ?ambiguous,
                "Ambiguous columns in record mapping; the first declaration wins, alias them in the projection"
            );
        }
        Ok(FieldMapping {
            record: record_name::<T>(),
            fields: self.fields,
            index,
            ambiguous,
            strict: self.strict,
        })
    }
}

/// Resolved column table of a record type
pub struct FieldMapping<T> {
    record: &'static str,
    fields: Vec<FieldDescriptor<T>>,
    index: HashMap<String, usize>,
    ambiguous: Vec<String>,
    strict: bool,
}

impl<T> fmt::Debug for FieldMapping<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldMapping")
            .field("record", &self.record)
            .field("fields", &self.fields)
            .field("ambiguous", &self.ambiguous)
            .field("strict", &self.strict)
            .finish()
    }
}

impl<T: Record> FieldMapping<T> {
    /// Short type name used in error messages
    pub fn record_name(&self) -> &'static str {
        self.record
    }

    /// Column names in declaration order, inlined members flattened
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|d| d.column.as_str())
    }

    pub fn fields(&self) -> &[FieldDescriptor<T>] {
        &self.fields
    }

    /// Column names declared more than once
    pub fn ambiguous_columns(&self) -> &[String] {
        &self.ambiguous
    }

    /// Descriptor a column name resolves to
    pub fn field(&self, column: &str) -> Option<&FieldDescriptor<T>> {
        self.index.get(column).map(|&i| &self.fields[i])
    }

    /// Ordered write set of a record; empty `omitempty` fields are left out
    pub fn encode(&self, record: &T) -> Vec<(String, DatabaseValue)> {
        self.index_order()
            .filter(|d| !(d.omit_empty && (d.is_empty)(record)))
            .map(|d| (d.column.clone(), (d.get)(record)))
            .collect()
    }

    /// Read one column of a record
    pub fn get(&self, record: &T, column: &str) -> Option<DatabaseValue> {
        self.field(column).map(|d| (d.get)(record))
    }

    /// Write one column of a record
    pub fn set(&self, record: &mut T, column: &str, value: DatabaseValue) -> Result<()> {
        let d = self.field(column).ok_or_else(|| {
            DatabaseError::mapping(self.record, column, "no field maps this column")
        })?;
        self.assign(d, record, value)
    }

    /// Decode a row into a fresh record
    pub fn decode(&self, row: &DatabaseRow) -> Result<T> {
        let mut record = T::default();
        self.decode_into(row, &mut record)?;
        Ok(record)
    }

    /// Decode a row over an existing record.
    ///
    /// When a row carries the same column name twice the first occurrence is
    /// used. Fields without a matching column keep their current value.
    pub fn decode_into(&self, row: &DatabaseRow, record: &mut T) -> Result<()> {
        for (pos, (name, value)) in row.iter().enumerate() {
            if row.columns()[..pos].iter().any(|c| c == name) {
                continue;
            }
            match self.field(name) {
                Some(d) => self.assign(d, record, value.clone())?,
                None if self.strict => {
                    return Err(DatabaseError::mapping(
                        self.record,
                        name,
                        "row column has no matching field",
                    ))
                }
                None => {}
            }
        }
        Ok(())
    }

    fn assign(&self, d: &FieldDescriptor<T>, record: &mut T, value: DatabaseValue) -> Result<()> {
        if value.is_null() && !d.nullable {
            return Err(DatabaseError::mapping(
                self.record,
                &d.column,
                "NULL cannot be stored in a non-nullable field; use Option",
            ));
        }
        (d.set)(record, value)
            .map_err(|e| DatabaseError::mapping(self.record, &d.column, e.to_string()))
    }

    fn index_order(&self) -> impl Iterator<Item = &FieldDescriptor<T>> {
        self.fields
            .iter()
            .enumerate()
            .filter(|(i, d)| self.index.get(&d.column) == Some(i))
            .map(|(_, d)| d)
    }
}

type Registry = RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Cached mapping of a record type, built on first use
///
/// # Errors
///
/// Returns `Mapping` when the type's declaration is invalid.
pub fn mapping<T: Record>() -> Result<Arc<FieldMapping<T>>> {
    let key = TypeId::of::<T>();
    if let Some(m) = registry().read().get(&key) {
        if let Ok(m) = m.clone().downcast::<FieldMapping<T>>() {
            return Ok(m);
        }
    }

    // Built without holding the lock: inline declarations resolve nested
    // mappings through this same function.
    let mut builder = MappingBuilder::<T>::new();
    T::describe(&mut builder);
    let built: Arc<dyn Any + Send + Sync> = Arc::new(builder.finish()?);

    let entry = registry().write().entry(key).or_insert(built).clone();
    entry.downcast::<FieldMapping<T>>().map_err(|_| {
        DatabaseError::mapping(record_name::<T>(), "", "mapping registry holds a foreign type")
    })
}

/// Encode a record into its ordered write set
pub fn encode<T: Record>(record: &T) -> Result<Vec<(String, DatabaseValue)>> {
    Ok(mapping::<T>()?.encode(record))
}

/// Decode a row into a record
pub fn decode<T: Record>(row: &DatabaseRow) -> Result<T> {
    mapping::<T>()?.decode(row)
}

fn record_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
