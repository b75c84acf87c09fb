// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Script Registry
//!
//! Maps logical operation names to PostgreSQL statements. Table names are
//! written as `{prefix}name` and the prefix is substituted once when the
//! registry is built, so deployments can keep the relay tables in their own
//! schema (`relay.`) or under a name prefix.

use crate::errors::StoreError;
use std::collections::HashMap;

const MESSAGE_COLUMNS: &str = "m.id, m.message_type, m.content, m.state, m.state_name, m.retry, \
     m.creation_time, m.creation_time_string, m.modify_time, m.publisher, m.publish_time, \
     m.publish_time_string, m.env";

const SUBSCRIPTION_COLUMNS: &str = "s.id, s.message_id, s.receiver_tag, s.exchange, s.route_key, \
     s.state_name, s.last_modify_time, s.last_modify_time_string";

/// Subscriptions in these states mean the message has not been delivered.
const UNDELIVERED: &str = "('Scheduled', 'Failed')";

/// Registry of named SQL scripts.
#[derive(Debug, Clone)]
pub struct ScriptStore {
    scripts: HashMap<String, String>,
}

impl ScriptStore {
    /// Builds the PostgreSQL script set with the given table prefix.
    pub fn postgres(prefix: &str) -> ScriptStore {
        let mut store = ScriptStore {
            scripts: HashMap::new(),
        };

        for (name, sql) in postgres_scripts() {
            store.register(name, &sql.replace("{prefix}", prefix));
        }

        store
    }

    /// Registers or replaces a script.
    pub fn register(&mut self, name: &str, sql: &str) {
        self.scripts.insert(name.to_owned(), sql.to_owned());
    }

    pub fn get(&self, name: &str) -> Result<&str, StoreError> {
        self.scripts
            .get(name)
            .map(|s| s.as_str())
            .ok_or_else(|| StoreError::UnknownScript(name.to_owned()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.scripts.keys().map(|k| k.as_str())
    }
}

fn postgres_scripts() -> Vec<(&'static str, String)> {
    vec![
        (
            "InsertMessage",
            "INSERT INTO {prefix}messages (id, message_type, content, state, state_name, retry, \
             creation_time, creation_time_string, modify_time, publisher, publish_time, \
             publish_time_string, env) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $7, $9, $10, $11, $12)"
                .to_owned(),
        ),
        (
            "InsertMessageLog",
            "INSERT INTO {prefix}message_logs (id, message_id, original_state, original_state_name, \
             state, state_name, creation_time, creation_time_string) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
                .to_owned(),
        ),
        (
            "ChangeMessageState",
            "UPDATE {prefix}messages SET state = $1, state_name = $2, modify_time = $3 WHERE id = $4"
                .to_owned(),
        ),
        (
            "IncreaseMessageRetry",
            "UPDATE {prefix}messages SET retry = retry + 1 WHERE id = $1 RETURNING retry"
                .to_owned(),
        ),
        (
            "FindOneMessage",
            format!("SELECT {MESSAGE_COLUMNS} FROM {{prefix}}messages m WHERE m.id = $1"),
        ),
        (
            "FindOneLockedMessage",
            format!("SELECT {MESSAGE_COLUMNS} FROM {{prefix}}messages m WHERE m.id = $1 FOR UPDATE"),
        ),
        (
            "FindProcessingMessage",
            "SELECT m.id FROM {prefix}messages m WHERE m.state = 2 ORDER BY m.id".to_owned(),
        ),
        (
            "FindOneSucceedMessage",
            format!(
                "SELECT {MESSAGE_COLUMNS} FROM {{prefix}}messages m \
                 LEFT JOIN {{prefix}}background_jobs j ON j.message_id = m.id \
                 WHERE m.state = 2 AND m.modify_time + COALESCE(j.delay_seconds, 0) < $1 \
                 AND NOT EXISTS (SELECT 1 FROM {{prefix}}subscriptions s \
                 WHERE s.message_id = m.id AND s.state_name IN {UNDELIVERED}) \
                 ORDER BY m.id LIMIT 1 FOR UPDATE OF m SKIP LOCKED"
            ),
        ),
        (
            "FindOneFailedMessage",
            format!(
                "SELECT {MESSAGE_COLUMNS} FROM {{prefix}}messages m \
                 LEFT JOIN {{prefix}}background_jobs j ON j.message_id = m.id \
                 WHERE m.state = 2 AND m.modify_time + COALESCE(j.delay_seconds, 0) < $1 \
                 AND EXISTS (SELECT 1 FROM {{prefix}}subscriptions s \
                 WHERE s.message_id = m.id AND s.state_name IN {UNDELIVERED}) \
                 ORDER BY m.id LIMIT 1 FOR UPDATE OF m SKIP LOCKED"
            ),
        ),
        (
            "FindOneRollbackMessage",
            format!(
                "SELECT {MESSAGE_COLUMNS} FROM {{prefix}}messages m WHERE m.state = 4 \
                 ORDER BY m.id LIMIT 1 FOR UPDATE SKIP LOCKED"
            ),
        ),
        (
            "FetchMessageLogs",
            "SELECT id, message_id, original_state, original_state_name, state, state_name, \
             creation_time, creation_time_string FROM {prefix}message_logs \
             WHERE message_id = $1 ORDER BY id"
                .to_owned(),
        ),
        (
            "InsertSubscription",
            "INSERT INTO {prefix}subscriptions (id, message_id, receiver_tag, exchange, route_key, \
             state_name, last_modify_time, last_modify_time_string) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
                .to_owned(),
        ),
        (
            "ChangeSubscriptionState",
            "UPDATE {prefix}subscriptions SET state_name = $1, last_modify_time = $2, \
             last_modify_time_string = $3 WHERE id = $4"
                .to_owned(),
        ),
        (
            "FetchSubscriptions",
            format!(
                "SELECT {SUBSCRIPTION_COLUMNS} FROM {{prefix}}subscriptions s \
                 WHERE s.message_id = $1 ORDER BY s.id"
            ),
        ),
        (
            "FindOneLockedSubscription",
            format!(
                "SELECT {SUBSCRIPTION_COLUMNS} FROM {{prefix}}subscriptions s \
                 WHERE s.message_id = $1 AND s.receiver_tag = $2 ORDER BY s.id LIMIT 1 FOR UPDATE"
            ),
        ),
        (
            "InsertFlow",
            "INSERT INTO {prefix}flows (id, subscription_id, state_name, remark, creation_time, \
             creation_time_string) VALUES ($1, $2, $3, $4, $5, $6)"
                .to_owned(),
        ),
        (
            "FetchFlows",
            "SELECT id, subscription_id, state_name, remark, creation_time, creation_time_string \
             FROM {prefix}flows WHERE subscription_id = $1 ORDER BY id"
                .to_owned(),
        ),
        (
            "InsertBackgroundJob",
            "INSERT INTO {prefix}background_jobs (id, message_id, expression, kind, kind_name, \
             delay_seconds, creation_time) VALUES ($1, $2, $3, $4, $5, $6, $7)"
                .to_owned(),
        ),
        (
            "FindBackgroundJob",
            "SELECT id, message_id, expression, kind, kind_name, delay_seconds, creation_time \
             FROM {prefix}background_jobs WHERE message_id = $1 ORDER BY id LIMIT 1"
                .to_owned(),
        ),
        (
            "FindOneTemplate",
            "SELECT id, name, description, creation_time, creation_time_string \
             FROM {prefix}sub_templates WHERE name = $1 LIMIT 1"
                .to_owned(),
        ),
        (
            "FetchSubTemplateDetails",
            "SELECT id, template_id, receiver_tag, exchange, route_key \
             FROM {prefix}sub_template_details WHERE template_id = $1 ORDER BY id"
                .to_owned(),
        ),
    ]
}
