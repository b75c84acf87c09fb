// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Store
//!
//! Interprets the named scripts against in-memory tables. Each transaction
//! works on a snapshot and keeps a log of its writes; committing replays the
//! log on the latest committed tables, so independent transactions that
//! overlap in time both persist. Dropping a transaction discards its log.
//!
//! Message row locks are modelled: `FindOneLockedMessage` waits for the
//! message's lock and then rereads the latest committed tables, and the
//! sweep scripts skip messages another transaction holds. A transaction
//! keeps its locks until it commits or is dropped.

use super::{Row, ScriptExecutor, Store, Transaction, Value};
use crate::errors::StoreError;
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};

const MESSAGES: &str = "messages";
const MESSAGE_LOGS: &str = "message_logs";
const SUBSCRIPTIONS: &str = "subscriptions";
const FLOWS: &str = "flows";
const BACKGROUND_JOBS: &str = "background_jobs";
const SUB_TEMPLATES: &str = "sub_templates";
const SUB_TEMPLATE_DETAILS: &str = "sub_template_details";

const MESSAGE_INSERT: [&str; 12] = [
    "id",
    "message_type",
    "content",
    "state",
    "state_name",
    "retry",
    "creation_time",
    "creation_time_string",
    "publisher",
    "publish_time",
    "publish_time_string",
    "env",
];
const LOG_COLUMNS: [&str; 8] = [
    "id",
    "message_id",
    "original_state",
    "original_state_name",
    "state",
    "state_name",
    "creation_time",
    "creation_time_string",
];
const SUBSCRIPTION_COLUMNS: [&str; 8] = [
    "id",
    "message_id",
    "receiver_tag",
    "exchange",
    "route_key",
    "state_name",
    "last_modify_time",
    "last_modify_time_string",
];
const FLOW_COLUMNS: [&str; 6] = [
    "id",
    "subscription_id",
    "state_name",
    "remark",
    "creation_time",
    "creation_time_string",
];
const JOB_COLUMNS: [&str; 7] = [
    "id",
    "message_id",
    "expression",
    "kind",
    "kind_name",
    "delay_seconds",
    "creation_time",
];

const PROCESSING: i64 = 2;
const FAILED: i64 = 4;

type Tables = HashMap<&'static str, Vec<Row>>;

#[derive(Default)]
struct Shared {
    committed: Mutex<Tables>,
    failures: Mutex<HashMap<String, usize>>,
    row_locks: Mutex<HashMap<String, Arc<RowLock<()>>>>,
}

/// Transactional in-memory [`Store`] with failure injection.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    /// Makes the next `times` executions of `script` fail. The pseudo script
    /// name `commit` fails commits instead.
    pub fn fail_next(&self, script: &str, times: usize) {
        lock(&self.shared.failures).insert(script.to_owned(), times);
    }

    /// Committed rows of `table`, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        lock(&self.shared.committed)
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Moves a committed message's last modification `secs` into the past.
    pub fn backdate_message(&self, id: &str, secs: i64) {
        let mut tables = lock(&self.shared.committed);
        let id = Value::from(id);

        for row in tables.entry(MESSAGES).or_default() {
            if row.get("id") == Some(&id) {
                let modified = row.int("modify_time").unwrap_or_default();
                row.set("modify_time", Value::Int(modified - secs));
            }
        }
    }

    /// Registers a subscriber template with `(tag, exchange, route_key)`
    /// details.
    pub fn add_template(&self, name: &str, details: &[(&str, &str, &str)]) {
        let mut tables = lock(&self.shared.committed);
        let template_id = format!("tpl-{name}");

        tables.entry(SUB_TEMPLATES).or_default().push(
            Row::new()
                .with("id", template_id.as_str())
                .with("name", name)
                .with("description", "")
                .with("creation_time", 0i64)
                .with("creation_time_string", ""),
        );

        let rows = tables.entry(SUB_TEMPLATE_DETAILS).or_default();
        for (idx, (tag, exchange, route_key)) in details.iter().enumerate() {
            rows.push(
                Row::new()
                    .with("id", format!("{template_id}-{idx}"))
                    .with("template_id", template_id.as_str())
                    .with("receiver_tag", *tag)
                    .with("exchange", *exchange)
                    .with("route_key", *route_key),
            );
        }
    }

    fn row_lock(&self, id: &str) -> Arc<RowLock<()>> {
        lock(&self.shared.row_locks)
            .entry(id.to_owned())
            .or_default()
            .clone()
    }

    fn take_failure(&self, name: &str) -> Result<(), StoreError> {
        let mut failures = lock(&self.shared.failures);

        match failures.get_mut(name) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(StoreError::Backend(format!("injected failure on `{name}`")))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        self.take_failure("begin")?;
        let working = lock(&self.shared.committed).clone();

        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            working,
            writes: Vec::new(),
            held: HashMap::new(),
        }))
    }
}

struct MemoryTransaction {
    store: MemoryStore,
    working: Tables,
    writes: Vec<(String, Vec<Value>)>,
    held: HashMap<String, OwnedMutexGuard<()>>,
}

impl MemoryTransaction {
    /// Waits for the row lock of the message in `$1`, then rebases the
    /// working tables on the latest commit.
    async fn lock_message(&mut self, params: &[Value]) -> Result<(), StoreError> {
        let id = match arg(params, 0)? {
            Value::Text(id) => id.clone(),
            _ => return Ok(()),
        };
        if self.held.contains_key(&id) {
            return Ok(());
        }

        let row_lock = self.store.row_lock(&id);
        let guard = row_lock.lock_owned().await;
        self.held.insert(id, guard);

        self.rebase()
    }

    fn rebase(&mut self) -> Result<(), StoreError> {
        let mut working = lock(&self.store.shared.committed).clone();
        for (name, params) in &self.writes {
            apply(&mut working, name, params)?;
        }
        self.working = working;

        Ok(())
    }

    /// First of `rows` whose message is free or already held here, locking it.
    fn skip_locked(&mut self, rows: Vec<Row>) -> Result<Vec<Row>, StoreError> {
        for row in rows {
            let id = row.text("id")?;
            if self.held.contains_key(&id) {
                return Ok(vec![row]);
            }
            if let Ok(guard) = self.store.row_lock(&id).try_lock_owned() {
                self.held.insert(id, guard);
                return Ok(vec![row]);
            }
        }

        Ok(Vec::new())
    }

    fn run(&mut self, name: &str, params: &[Value]) -> Result<Outcome, StoreError> {
        self.store.take_failure(name)?;

        let outcome = apply(&mut self.working, name, params)?;
        if outcome.write {
            self.writes.push((name.to_owned(), params.to_vec()));
        }

        Ok(outcome)
    }
}

#[async_trait]
impl ScriptExecutor for MemoryTransaction {
    async fn exec_script(&mut self, name: &str, params: &[Value]) -> Result<u64, StoreError> {
        Ok(self.run(name, params)?.affected)
    }

    async fn query_script(&mut self, name: &str, params: &[Value]) -> Result<Vec<Row>, StoreError> {
        match name {
            "FindOneLockedMessage" => {
                self.lock_message(params).await?;
                Ok(self.run(name, params)?.rows)
            }
            "FindOneSucceedMessage" | "FindOneFailedMessage" | "FindOneRollbackMessage" => {
                let candidates = self.run(name, params)?.rows;
                self.skip_locked(candidates)
            }
            _ => Ok(self.run(name, params)?.rows),
        }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.store.take_failure("commit")?;

        let mut committed = lock(&self.store.shared.committed);
        let mut next = committed.clone();
        for (name, params) in &self.writes {
            apply(&mut next, name, params)?;
        }
        *committed = next;

        Ok(())
    }

    fn executor(&mut self) -> &mut dyn ScriptExecutor {
        self
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct Outcome {
    rows: Vec<Row>,
    affected: u64,
    write: bool,
}

impl Outcome {
    fn read(rows: Vec<Row>) -> Outcome {
        Outcome {
            rows,
            ..Outcome::default()
        }
    }

    fn written(affected: u64) -> Outcome {
        Outcome {
            affected,
            write: true,
            ..Outcome::default()
        }
    }
}

fn apply(tables: &mut Tables, name: &str, params: &[Value]) -> Result<Outcome, StoreError> {
    match name {
        "InsertMessage" => {
            let mut row = build_row(&MESSAGE_INSERT, params)?;
            row.push("modify_time", arg(params, 6)?.clone());
            insert(tables, MESSAGES, row)
        }
        "InsertMessageLog" => insert(tables, MESSAGE_LOGS, build_row(&LOG_COLUMNS, params)?),
        "InsertSubscription" => insert(
            tables,
            SUBSCRIPTIONS,
            build_row(&SUBSCRIPTION_COLUMNS, params)?,
        ),
        "InsertFlow" => insert(tables, FLOWS, build_row(&FLOW_COLUMNS, params)?),
        "InsertBackgroundJob" => insert(tables, BACKGROUND_JOBS, build_row(&JOB_COLUMNS, params)?),
        "ChangeMessageState" => Ok(Outcome::written(update(
            tables,
            MESSAGES,
            arg(params, 3)?,
            &[
                ("state", arg(params, 0)?),
                ("state_name", arg(params, 1)?),
                ("modify_time", arg(params, 2)?),
            ],
        ))),
        "ChangeSubscriptionState" => Ok(Outcome::written(update(
            tables,
            SUBSCRIPTIONS,
            arg(params, 3)?,
            &[
                ("state_name", arg(params, 0)?),
                ("last_modify_time", arg(params, 1)?),
                ("last_modify_time_string", arg(params, 2)?),
            ],
        ))),
        "IncreaseMessageRetry" => {
            let id = arg(params, 0)?;
            let mut rows = Vec::new();
            for row in tables.entry(MESSAGES).or_default() {
                if row.get("id") == Some(id) {
                    let retry = row.int("retry")? + 1;
                    row.set("retry", Value::Int(retry));
                    rows.push(Row::new().with("retry", retry));
                }
            }
            Ok(Outcome {
                affected: rows.len() as u64,
                rows,
                write: true,
            })
        }
        "FindOneMessage" | "FindOneLockedMessage" => Ok(Outcome::read(first(select(
            tables,
            MESSAGES,
            &[("id", arg(params, 0)?)],
        )))),
        "FindProcessingMessage" => Ok(Outcome::read(
            select(tables, MESSAGES, &[("state", &Value::Int(PROCESSING))])
                .into_iter()
                .map(|row| Row::new().with("id", row.get("id").cloned().unwrap_or(Value::Null)))
                .collect(),
        )),
        "FindOneSucceedMessage" => sweep_candidates(tables, params, false).map(Outcome::read),
        "FindOneFailedMessage" => sweep_candidates(tables, params, true).map(Outcome::read),
        "FindOneRollbackMessage" => Ok(Outcome::read(by_id(select(
            tables,
            MESSAGES,
            &[("state", &Value::Int(FAILED))],
        )))),
        "FetchMessageLogs" => Ok(Outcome::read(select(
            tables,
            MESSAGE_LOGS,
            &[("message_id", arg(params, 0)?)],
        ))),
        "FetchSubscriptions" => Ok(Outcome::read(select(
            tables,
            SUBSCRIPTIONS,
            &[("message_id", arg(params, 0)?)],
        ))),
        "FindOneLockedSubscription" => Ok(Outcome::read(first(select(
            tables,
            SUBSCRIPTIONS,
            &[
                ("message_id", arg(params, 0)?),
                ("receiver_tag", arg(params, 1)?),
            ],
        )))),
        "FetchFlows" => Ok(Outcome::read(select(
            tables,
            FLOWS,
            &[("subscription_id", arg(params, 0)?)],
        ))),
        "FindBackgroundJob" => Ok(Outcome::read(first(select(
            tables,
            BACKGROUND_JOBS,
            &[("message_id", arg(params, 0)?)],
        )))),
        "FindOneTemplate" => Ok(Outcome::read(first(select(
            tables,
            SUB_TEMPLATES,
            &[("name", arg(params, 0)?)],
        )))),
        "FetchSubTemplateDetails" => Ok(Outcome::read(select(
            tables,
            SUB_TEMPLATE_DETAILS,
            &[("template_id", arg(params, 0)?)],
        ))),
        other => Err(StoreError::UnknownScript(other.to_owned())),
    }
}

fn arg<'a>(params: &'a [Value], idx: usize) -> Result<&'a Value, StoreError> {
    params
        .get(idx)
        .ok_or_else(|| StoreError::Backend(format!("missing parameter ${}", idx + 1)))
}

fn build_row(columns: &[&str], params: &[Value]) -> Result<Row, StoreError> {
    let mut row = Row::new();
    for (idx, column) in columns.iter().enumerate() {
        row.push(column, arg(params, idx)?.clone());
    }
    Ok(row)
}

fn insert(tables: &mut Tables, table: &'static str, row: Row) -> Result<Outcome, StoreError> {
    let rows = tables.entry(table).or_default();

    if rows.iter().any(|existing| existing.get("id") == row.get("id")) {
        return Err(StoreError::Backend(format!(
            "duplicate key in `{table}`: {:?}",
            row.get("id")
        )));
    }
    rows.push(row);

    Ok(Outcome::written(1))
}

fn update(tables: &mut Tables, table: &'static str, id: &Value, set: &[(&str, &Value)]) -> u64 {
    let mut affected = 0;

    for row in tables.entry(table).or_default() {
        if row.get("id") == Some(id) {
            for (column, value) in set {
                row.set(column, (*value).clone());
            }
            affected += 1;
        }
    }

    affected
}

fn select(tables: &Tables, table: &str, filter: &[(&str, &Value)]) -> Vec<Row> {
    tables
        .get(table)
        .map(|rows| {
            rows.iter()
                .filter(|row| filter.iter().all(|(column, value)| row.get(column) == Some(*value)))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

fn by_id(mut rows: Vec<Row>) -> Vec<Row> {
    rows.sort_by_key(|row| row.text("id").unwrap_or_default());
    rows
}

fn first(rows: Vec<Row>) -> Vec<Row> {
    rows.into_iter().take(1).collect()
}

/// Processing messages past `$1` (job delay included), in id order, whose
/// undelivered-subscription existence matches `undelivered`. The caller
/// keeps the first one it can lock.
fn sweep_candidates(
    tables: &Tables,
    params: &[Value],
    undelivered: bool,
) -> Result<Vec<Row>, StoreError> {
    let threshold = match arg(params, 0)? {
        Value::Int(v) => *v,
        _ => return Err(StoreError::Backend("sweep threshold must be an integer".to_owned())),
    };

    let mut candidates = Vec::new();
    for message in select(tables, MESSAGES, &[("state", &Value::Int(PROCESSING))]) {
        let id = message.get("id").cloned().unwrap_or(Value::Null);
        let delay = match first(select(tables, BACKGROUND_JOBS, &[("message_id", &id)])).first() {
            Some(job) => job.int("delay_seconds")?,
            None => 0,
        };
        if message.int("modify_time")? + delay >= threshold {
            continue;
        }

        let pending = select(tables, SUBSCRIPTIONS, &[("message_id", &id)])
            .iter()
            .any(|sub| {
                matches!(sub.get("state_name"), Some(Value::Text(name)) if name == "Scheduled" || name == "Failed")
            });
        if pending == undelivered {
            candidates.push(message);
        }
    }

    Ok(by_id(candidates))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_params(id: &str, state: i64, modify_time: i64) -> Vec<Value> {
        vec![
            id.into(),
            "t".into(),
            "c".into(),
            state.into(),
            "".into(),
            0i64.into(),
            modify_time.into(),
            "".into(),
            "p".into(),
            0i64.into(),
            "".into(),
            "".into(),
        ]
    }

    #[tokio::test]
    async fn overlapping_transactions_both_persist() {
        let store = MemoryStore::new();
        let mut outer = store.begin().await.unwrap();
        outer
            .exec_script("InsertMessage", &message_params("a", 1, 10))
            .await
            .unwrap();

        let mut inner = store.begin().await.unwrap();
        inner
            .exec_script("InsertMessage", &message_params("b", 1, 10))
            .await
            .unwrap();
        inner.commit().await.unwrap();
        outer.commit().await.unwrap();

        assert_eq!(store.rows("messages").len(), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryStore::new();
        store.fail_next("InsertMessage", 1);
        let mut tx = store.begin().await.unwrap();

        assert!(tx
            .exec_script("InsertMessage", &message_params("a", 1, 10))
            .await
            .is_err());
        assert!(tx
            .exec_script("InsertMessage", &message_params("a", 1, 10))
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn locked_read_waits_for_the_holder_and_sees_its_commit() {
        let store = MemoryStore::new();
        let mut setup = store.begin().await.unwrap();
        setup
            .exec_script("InsertMessage", &message_params("a", 1, 10))
            .await
            .unwrap();
        setup.commit().await.unwrap();

        let mut holder = store.begin().await.unwrap();
        holder
            .query_script("FindOneLockedMessage", &["a".into()])
            .await
            .unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut tx = store.begin().await.unwrap();
                let rows = tx
                    .query_script("FindOneLockedMessage", &["a".into()])
                    .await
                    .unwrap();
                rows[0].int("state").unwrap()
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        holder
            .exec_script(
                "ChangeMessageState",
                &[PROCESSING.into(), "Processing".into(), 20i64.into(), "a".into()],
            )
            .await
            .unwrap();
        holder.commit().await.unwrap();

        assert_eq!(waiter.await.unwrap(), PROCESSING);
    }

    #[tokio::test]
    async fn sweeps_skip_messages_locked_elsewhere() {
        let store = MemoryStore::new();
        let mut setup = store.begin().await.unwrap();
        setup
            .exec_script("InsertMessage", &message_params("old", PROCESSING, 100))
            .await
            .unwrap();
        setup
            .exec_script("InsertMessage", &message_params("other", PROCESSING, 50))
            .await
            .unwrap();
        setup.commit().await.unwrap();

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        let mut third = store.begin().await.unwrap();
        let a = first
            .query_script("FindOneSucceedMessage", &[Value::Int(200)])
            .await
            .unwrap();
        let b = second
            .query_script("FindOneSucceedMessage", &[Value::Int(200)])
            .await
            .unwrap();
        let c = third
            .query_script("FindOneSucceedMessage", &[Value::Int(200)])
            .await
            .unwrap();

        assert_eq!(a[0].text("id").unwrap(), "old");
        assert_eq!(b[0].text("id").unwrap(), "other");
        assert!(c.is_empty());

        drop(first);
        let d = third
            .query_script("FindOneSucceedMessage", &[Value::Int(200)])
            .await
            .unwrap();
        assert_eq!(d[0].text("id").unwrap(), "old");
    }

    #[tokio::test]
    async fn sweep_honours_age_threshold() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.exec_script("InsertMessage", &message_params("old", PROCESSING, 100))
            .await
            .unwrap();
        tx.exec_script("InsertMessage", &message_params("young", PROCESSING, 500))
            .await
            .unwrap();

        let rows = tx
            .query_script("FindOneSucceedMessage", &[Value::Int(200)])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text("id").unwrap(), "old");

        assert!(tx
            .query_script("FindOneFailedMessage", &[Value::Int(200)])
            .await
            .unwrap()
            .is_empty());
    }
}
