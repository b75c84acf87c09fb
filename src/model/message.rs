// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use super::{
    format_time, new_ordered_id, unix_now, MessageState, SubTemplate, Subscription,
    SUBSCRIPTION_SCHEDULED,
};
use crate::{
    errors::StoreError,
    payload::IngestRequest,
    store::{Row, ScriptExecutor, Value},
};
use async_trait::async_trait;
use tracing::debug;

/// Hook run by [`Message::append_message`] after the message and its
/// subscriptions are written, inside the same transaction.
#[async_trait]
pub trait ExtensionHandler: Send + Sync {
    async fn handle(&self, message_id: &str, exec: &mut dyn ScriptExecutor)
        -> Result<(), StoreError>;
}

/// A message accepted for delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub message_type: String,
    pub content: String,
    pub state: MessageState,
    pub retry: i64,
    pub creation_time: i64,
    pub modify_time: i64,
    pub publisher: String,
    pub publish_time: i64,
    pub env: String,
}

impl Message {
    pub fn from_row(row: &Row) -> Result<Message, StoreError> {
        Ok(Message {
            id: row.text("id")?,
            message_type: row.text("message_type")?,
            content: row.text("content")?,
            state: MessageState::from_code(row.int("state")?),
            retry: row.int("retry")?,
            creation_time: row.int("creation_time")?,
            modify_time: row.int("modify_time")?,
            publisher: row.text("publisher")?,
            publish_time: row.int("publish_time")?,
            env: row.text("env")?,
        })
    }

    /// Inserts the message row. An empty id is replaced by a fresh ordered id.
    pub async fn append(&mut self, exec: &mut dyn ScriptExecutor) -> Result<(), StoreError> {
        if self.id.is_empty() {
            self.id = new_ordered_id();
        }
        if self.creation_time == 0 {
            self.creation_time = unix_now();
        }
        self.modify_time = self.creation_time;

        exec.exec_script(
            "InsertMessage",
            &[
                self.id.as_str().into(),
                self.message_type.as_str().into(),
                self.content.as_str().into(),
                self.state.code().into(),
                self.state.name().into(),
                self.retry.into(),
                self.creation_time.into(),
                format_time(self.creation_time).into(),
                self.publisher.as_str().into(),
                self.publish_time.into(),
                format_time(self.publish_time).into(),
                self.env.as_str().into(),
            ],
        )
        .await?;

        Ok(())
    }

    /// Moves the message to `to` and records the transition, both through
    /// `exec`. Transitions outside the state machine are rejected before any
    /// write.
    pub async fn change_state(
        &mut self,
        to: MessageState,
        exec: &mut dyn ScriptExecutor,
    ) -> Result<(), StoreError> {
        if !self.state.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                id: self.id.clone(),
                from: self.state,
                to,
            });
        }

        let now = unix_now();
        exec.exec_script(
            "ChangeMessageState",
            &[
                to.code().into(),
                to.name().into(),
                now.into(),
                self.id.as_str().into(),
            ],
        )
        .await?;

        let mut log = MessageLog {
            message_id: self.id.clone(),
            original_state: self.state,
            state: to,
            creation_time: now,
            ..MessageLog::default()
        };
        log.append(exec).await?;

        debug!(message_id = self.id, from = %self.state, to = %to, "message state changed");
        self.state = to;
        self.modify_time = now;

        Ok(())
    }

    /// Increments the persisted retry counter and returns its new value.
    pub async fn increase_retry(
        &mut self,
        exec: &mut dyn ScriptExecutor,
    ) -> Result<i64, StoreError> {
        let row = exec
            .query_script_row("IncreaseMessageRetry", &[self.id.as_str().into()])
            .await?;

        self.retry = match row {
            Some(row) => row.int("retry")?,
            None => self.retry + 1,
        };

        Ok(self.retry)
    }

    /// Every subscription of this message, in insertion order.
    pub async fn fetch_subscriptions(
        &self,
        exec: &mut dyn ScriptExecutor,
    ) -> Result<Vec<Subscription>, StoreError> {
        exec.query_script("FetchSubscriptions", &[self.id.as_str().into()])
            .await?
            .iter()
            .map(Subscription::from_row)
            .collect()
    }

    /// The audit trail of state changes, oldest first.
    pub async fn fetch_logs(
        &self,
        exec: &mut dyn ScriptExecutor,
    ) -> Result<Vec<MessageLog>, StoreError> {
        exec.query_script("FetchMessageLogs", &[self.id.as_str().into()])
            .await?
            .iter()
            .map(MessageLog::from_row)
            .collect()
    }

    /// Loads a message by id, row-locking it when `lock` is set.
    pub async fn find_one(
        id: &str,
        lock: bool,
        exec: &mut dyn ScriptExecutor,
    ) -> Result<Option<Message>, StoreError> {
        let script = if lock {
            "FindOneLockedMessage"
        } else {
            "FindOneMessage"
        };

        Self::find_one_by(script, &[id.into()], exec).await
    }

    /// Runs a single-row message query such as the sweep scripts.
    pub async fn find_one_by(
        script: &str,
        params: &[Value],
        exec: &mut dyn ScriptExecutor,
    ) -> Result<Option<Message>, StoreError> {
        exec.query_script_row(script, params)
            .await?
            .as_ref()
            .map(Message::from_row)
            .transpose()
    }

    /// Ids of every message currently in Processing.
    pub async fn find_processing_ids(
        exec: &mut dyn ScriptExecutor,
    ) -> Result<Vec<String>, StoreError> {
        exec.query_script("FindProcessingMessage", &[])
            .await?
            .iter()
            .map(|row| row.text("id"))
            .collect()
    }

    /// Writes a new message in Scheduled with its initial log, one
    /// subscription (and flow) per subscriber and whatever `extension` adds.
    ///
    /// Without explicit subscribers the named template supplies them. The
    /// caller owns the transaction behind `exec`.
    pub async fn append_message(
        request: &IngestRequest,
        extension: Option<&dyn ExtensionHandler>,
        exec: &mut dyn ScriptExecutor,
    ) -> Result<Message, StoreError> {
        let now = unix_now();
        let mut message = Message {
            message_type: request.message_type.clone(),
            content: request.content.clone(),
            state: MessageState::Scheduled,
            creation_time: now,
            publisher: request.publisher.clone(),
            publish_time: if request.publish_time > 0 {
                request.publish_time
            } else {
                now
            },
            env: request.env.clone(),
            ..Message::default()
        };
        message.append(exec).await?;

        let mut log = MessageLog {
            message_id: message.id.clone(),
            original_state: MessageState::Unknown,
            state: MessageState::Scheduled,
            creation_time: now,
            ..MessageLog::default()
        };
        log.append(exec).await?;

        let subscribers: Vec<(String, String, String)> = if !request.subscriptions.is_empty() {
            request
                .subscriptions
                .iter()
                .map(|s| (s.tag.clone(), s.exchange.clone(), s.route_key.clone()))
                .collect()
        } else if let Some(name) = request.template.as_deref().filter(|n| !n.is_empty()) {
            let template = SubTemplate::find_by_name(name, exec)
                .await?
                .ok_or_else(|| StoreError::Validation(format!("template `{name}` not found")))?;
            template
                .fetch_details(exec)
                .await?
                .into_iter()
                .map(|d| (d.receiver_tag, d.exchange, d.route_key))
                .collect()
        } else {
            Vec::new()
        };

        for (receiver_tag, exchange, route_key) in subscribers {
            let mut subscription = Subscription {
                message_id: message.id.clone(),
                receiver_tag,
                exchange,
                route_key,
                state_name: SUBSCRIPTION_SCHEDULED.to_owned(),
                ..Subscription::default()
            };
            subscription.append(exec).await?;
            subscription.append_flow("", exec).await?;
        }

        if let Some(extension) = extension {
            extension.handle(&message.id, exec).await?;
        }

        Ok(message)
    }
}

/// Audit row of one message state transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageLog {
    pub id: String,
    pub message_id: String,
    pub original_state: MessageState,
    pub state: MessageState,
    pub creation_time: i64,
}

impl MessageLog {
    pub fn from_row(row: &Row) -> Result<MessageLog, StoreError> {
        Ok(MessageLog {
            id: row.text("id")?,
            message_id: row.text("message_id")?,
            original_state: MessageState::from_code(row.int("original_state")?),
            state: MessageState::from_code(row.int("state")?),
            creation_time: row.int("creation_time")?,
        })
    }

    pub async fn append(&mut self, exec: &mut dyn ScriptExecutor) -> Result<(), StoreError> {
        if self.message_id.is_empty() {
            return Err(StoreError::MissingOwner("message id"));
        }
        if self.id.is_empty() {
            self.id = new_ordered_id();
        }
        if self.creation_time == 0 {
            self.creation_time = unix_now();
        }

        exec.exec_script(
            "InsertMessageLog",
            &[
                self.id.as_str().into(),
                self.message_id.as_str().into(),
                self.original_state.code().into(),
                self.original_state.name().into(),
                self.state.code().into(),
                self.state.name().into(),
                self.creation_time.into(),
                format_time(self.creation_time).into(),
            ],
        )
        .await?;

        Ok(())
    }
}
