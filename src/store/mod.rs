// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Named-Script Persistence
//!
//! The delivery layer never writes SQL inline. Every statement is looked up by
//! a logical name (`InsertMessage`, `FindOneLockedMessage`, ...) in a
//! [`ScriptStore`](scripts::ScriptStore) and executed with positional
//! parameters through a [`ScriptExecutor`].
//!
//! - [`Store`]: hands out read-committed transactions
//! - [`Transaction`]: a [`ScriptExecutor`] that can be committed; dropping it
//!   without committing rolls back
//! - [`Value`] / [`Row`]: the positional parameter and result row types

pub mod postgres;
pub mod scripts;

#[cfg(any(test, feature = "test-tools"))]
pub mod memory;

use crate::errors::StoreError;
use async_trait::async_trait;

/// A positional script parameter or a column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Int(i64),
    Text(String),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<&String> for Value {
    fn from(value: &String) -> Self {
        Value::Text(value.clone())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value as i64)
    }
}

impl From<i16> for Value {
    fn from(value: i16) -> Self {
        Value::Int(value as i64)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A result row with columns addressed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Row::default()
    }

    /// Appends a column, builder style.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.columns.push((name.to_owned(), value.into()));
        self
    }

    pub fn push(&mut self, name: &str, value: Value) {
        self.columns.push((name.to_owned(), value));
    }

    /// Replaces a column value, appending the column when absent.
    pub fn set(&mut self, name: &str, value: Value) {
        match self.columns.iter_mut().find(|(column, _)| column == name) {
            Some((_, slot)) => *slot = value,
            None => self.push(name, value),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }

    /// Reads a text column; NULL reads as an empty string.
    pub fn text(&self, name: &str) -> Result<String, StoreError> {
        match self.get(name) {
            Some(Value::Text(v)) => Ok(v.clone()),
            Some(Value::Null) => Ok(String::new()),
            _ => Err(StoreError::Decode {
                column: name.to_owned(),
                expected: "text",
            }),
        }
    }

    /// Reads an integer column; NULL reads as zero.
    pub fn int(&self, name: &str) -> Result<i64, StoreError> {
        match self.get(name) {
            Some(Value::Int(v)) => Ok(*v),
            Some(Value::Null) => Ok(0),
            _ => Err(StoreError::Decode {
                column: name.to_owned(),
                expected: "integer",
            }),
        }
    }
}

/// Executes named scripts with positional parameters.
#[async_trait]
pub trait ScriptExecutor: Send {
    /// Runs a statement and returns the number of affected rows.
    async fn exec_script(&mut self, name: &str, params: &[Value]) -> Result<u64, StoreError>;

    /// Runs a query and returns every row.
    async fn query_script(&mut self, name: &str, params: &[Value])
        -> Result<Vec<Row>, StoreError>;

    /// Runs a query and returns its first row, if any.
    async fn query_script_row(
        &mut self,
        name: &str,
        params: &[Value],
    ) -> Result<Option<Row>, StoreError> {
        Ok(self.query_script(name, params).await?.into_iter().next())
    }
}

/// A read-committed unit of work. Dropping it without [`commit`] discards
/// every write made through it.
///
/// [`commit`]: Transaction::commit
#[async_trait]
pub trait Transaction: ScriptExecutor {
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Lets callers hand the transaction to functions expecting a plain
    /// executor.
    fn executor(&mut self) -> &mut dyn ScriptExecutor;
}

/// Source of store transactions.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;
}
