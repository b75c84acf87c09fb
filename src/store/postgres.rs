// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # PostgreSQL Store
//!
//! Executes named scripts on a `sqlx` Postgres pool. Every transaction is
//! opened at READ COMMITTED; row locks come from the `FOR UPDATE` clauses of
//! the `FindOneLocked*` and sweep scripts.

use super::{scripts::ScriptStore, Row, ScriptExecutor, Store, Transaction, Value};
use crate::errors::StoreError;
use async_trait::async_trait;
use sqlx::{
    postgres::{PgArguments, PgPoolOptions, PgRow},
    query::Query,
    Column, PgPool, Postgres, Row as _, TypeInfo,
};
use std::sync::Arc;
use tracing::{debug, error};

/// Store backed by a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    scripts: Arc<ScriptStore>,
}

impl PgStore {
    pub fn new(pool: PgPool, scripts: ScriptStore) -> PgStore {
        PgStore {
            pool,
            scripts: Arc::new(scripts),
        }
    }

    /// Connects a pool to `url`.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        scripts: ScriptStore,
    ) -> Result<PgStore, StoreError> {
        debug!("creating database pool...");
        let pool = match PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
        {
            Ok(pool) => Ok(pool),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect to the database");
                Err(StoreError::Database(err))
            }
        }?;
        debug!("database pool created");

        Ok(PgStore::new(pool, scripts))
    }

    /// Applies the bundled schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .execute(&mut *tx)
            .await?;

        Ok(Box::new(PgTransaction {
            tx,
            scripts: self.scripts.clone(),
        }))
    }
}

struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
    scripts: Arc<ScriptStore>,
}

#[async_trait]
impl ScriptExecutor for PgTransaction {
    async fn exec_script(&mut self, name: &str, params: &[Value]) -> Result<u64, StoreError> {
        let scripts = self.scripts.clone();
        let sql = scripts.get(name)?;
        debug!(script = name, "executing script");

        let result = bind_all(sql, params).execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    async fn query_script(
        &mut self,
        name: &str,
        params: &[Value],
    ) -> Result<Vec<Row>, StoreError> {
        let scripts = self.scripts.clone();
        let sql = scripts.get(name)?;
        debug!(script = name, "querying script");

        let rows = bind_all(sql, params).fetch_all(&mut *self.tx).await?;
        rows.iter().map(decode_row).collect()
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    fn executor(&mut self) -> &mut dyn ScriptExecutor {
        self
    }
}

fn bind_all<'q>(sql: &'q str, params: &'q [Value]) -> Query<'q, Postgres, PgArguments> {
    let mut query = sqlx::query(sql);

    for param in params {
        query = match param {
            // Only text columns are nullable in the relay schema.
            Value::Null => query.bind(None::<String>),
            Value::Int(v) => query.bind(*v),
            Value::Text(v) => query.bind(v.as_str()),
        };
    }

    query
}

fn decode_row(row: &PgRow) -> Result<Row, StoreError> {
    let mut out = Row::new();

    for (idx, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "INT8" => row.try_get::<Option<i64>, _>(idx)?.map(Value::Int),
            "INT4" => row
                .try_get::<Option<i32>, _>(idx)?
                .map(|v| Value::Int(v as i64)),
            "INT2" => row
                .try_get::<Option<i16>, _>(idx)?
                .map(|v| Value::Int(v as i64)),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
                row.try_get::<Option<String>, _>(idx)?.map(Value::Text)
            }
            _ => {
                return Err(StoreError::Decode {
                    column: column.name().to_owned(),
                    expected: "integer or text",
                })
            }
        };

        out.push(column.name(), value.unwrap_or(Value::Null));
    }

    Ok(out)
}
