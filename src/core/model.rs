//! Records bound to a table, with lifecycle hooks
//!
//! A [`Model`] is a [`Record`] that knows its table. Sessions and
//! transactions can fetch, save and delete models directly; the hooks run
//! around each write and an error from a `before_*` hook aborts the write.

use crate::core::condition::{cond, Condition};
use crate::core::context::Context;
use crate::core::error::{DatabaseError, Result};
use crate::core::mapper::{mapping, Record};
use crate::core::query_builder::{Deleter, Selector, Updater};
use crate::core::session::{Collection, Scope};
use crate::core::value::DatabaseValue;

/// A record stored in one table
pub trait Model: Record {
    /// Table holding the records
    fn table() -> &'static str;

    fn before_insert(&mut self) -> Result<()> {
        Ok(())
    }

    fn after_insert(&mut self) -> Result<()> {
        Ok(())
    }

    fn before_update(&mut self) -> Result<()> {
        Ok(())
    }

    fn after_update(&mut self) -> Result<()> {
        Ok(())
    }

    fn before_delete(&self) -> Result<()> {
        Ok(())
    }

    fn after_delete(&self) -> Result<()> {
        Ok(())
    }
}

/// The single primary key column of `M`'s table and the record's value for it
async fn key_of<M: Model>(
    scope: &Scope,
    ctx: &Context,
    record: &M,
) -> Result<(String, DatabaseValue)> {
    let keys = scope.primary_keys(ctx, M::table()).await?;
    let pk = match keys.as_ref() {
        [pk] => pk.clone(),
        [] => {
            return Err(DatabaseError::invalid_query(format!(
                "{} has no primary key",
                M::table()
            )))
        }
        _ => {
            return Err(DatabaseError::unsupported(format!(
                "{} has a composite primary key",
                M::table()
            )))
        }
    };
    let value = mapping::<M>()?.get(record, &pk).ok_or_else(|| {
        DatabaseError::mapping(
            std::any::type_name::<M>(),
            pk.as_str(),
            "primary key column is not mapped",
        )
    })?;
    Ok((pk, value))
}

pub(crate) async fn get<M: Model>(scope: &Scope, ctx: &Context, condition: Condition) -> Result<M> {
    Selector::bound(scope.clone())
        .from(M::table())
        .where_(condition)
        .with_context(ctx.clone())
        .one()
        .await
}

/// Insert when the primary key is empty, otherwise update by primary key
pub(crate) async fn save<M: Model>(scope: &Scope, ctx: &Context, record: &mut M) -> Result<()> {
    let (pk, key) = key_of(scope, ctx, record).await?;
    let mapping = mapping::<M>()?;

    if key.is_zero() {
        record.before_insert()?;
        let pairs: Vec<_> = mapping
            .encode(record)
            .into_iter()
            .filter(|(c, _)| *c != pk)
            .collect();
        let res = Collection::new(scope.clone(), M::table())
            .with_context(ctx.clone())
            .insert_pairs(pairs)
            .await?;
        if let Some(id) = res.id() {
            mapping.set(record, &pk, id.clone())?;
        }
        tracing::debug!(table = M::table(), "Record inserted");
        return record.after_insert();
    }

    record.before_update()?;
    let mut updater = Updater::bound(scope.clone(), M::table()).with_context(ctx.clone());
    for (column, value) in mapping.encode(record) {
        if column != pk {
            updater = updater.set(&column, value);
        }
    }
    let res = updater.where_(cond(&pk, key)).exec().await?;
    if res.rows_affected == 0 {
        return Err(DatabaseError::not_found(M::table()));
    }
    record.after_update()
}

pub(crate) async fn delete<M: Model>(scope: &Scope, ctx: &Context, record: &M) -> Result<()> {
    let (pk, key) = key_of(scope, ctx, record).await?;
    record.before_delete()?;
    let res = Deleter::bound(scope.clone(), M::table())
        .with_context(ctx.clone())
        .where_(cond(&pk, key))
        .exec()
        .await?;
    if res.rows_affected == 0 {
        return Err(DatabaseError::not_found(M::table()));
    }
    record.after_delete()
}
