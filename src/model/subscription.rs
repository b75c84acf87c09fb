// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use super::{format_time, new_ordered_id, unix_now};
use crate::{
    errors::StoreError,
    store::{Row, ScriptExecutor},
};

/// Status of a subscription waiting for its first publish.
pub const SUBSCRIPTION_SCHEDULED: &str = "Scheduled";
/// Status of a subscription whose delivery went out to the broker.
pub const SUBSCRIPTION_PUBLISHED: &str = "Published";

/// One receiver of a message.
///
/// `state_name` is free-form: the relay writes `Scheduled` and `Published`,
/// receivers report their own statuses through the change-state operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub message_id: String,
    pub receiver_tag: String,
    pub exchange: String,
    pub route_key: String,
    pub state_name: String,
    pub last_modify_time: i64,
}

impl Subscription {
    pub fn from_row(row: &Row) -> Result<Subscription, StoreError> {
        Ok(Subscription {
            id: row.text("id")?,
            message_id: row.text("message_id")?,
            receiver_tag: row.text("receiver_tag")?,
            exchange: row.text("exchange")?,
            route_key: row.text("route_key")?,
            state_name: row.text("state_name")?,
            last_modify_time: row.int("last_modify_time")?,
        })
    }

    pub async fn append(&mut self, exec: &mut dyn ScriptExecutor) -> Result<(), StoreError> {
        if self.message_id.is_empty() {
            return Err(StoreError::MissingOwner("message id"));
        }
        if self.id.is_empty() {
            self.id = new_ordered_id();
        }
        if self.last_modify_time == 0 {
            self.last_modify_time = unix_now();
        }

        exec.exec_script(
            "InsertSubscription",
            &[
                self.id.as_str().into(),
                self.message_id.as_str().into(),
                self.receiver_tag.as_str().into(),
                self.exchange.as_str().into(),
                self.route_key.as_str().into(),
                self.state_name.as_str().into(),
                self.last_modify_time.into(),
                format_time(self.last_modify_time).into(),
            ],
        )
        .await?;

        Ok(())
    }

    /// Records a flow row for the current status.
    pub async fn append_flow(
        &self,
        remark: &str,
        exec: &mut dyn ScriptExecutor,
    ) -> Result<Flow, StoreError> {
        let mut flow = Flow {
            subscription_id: self.id.clone(),
            state_name: self.state_name.clone(),
            remark: (!remark.is_empty()).then(|| remark.to_owned()),
            ..Flow::default()
        };
        flow.append(exec).await?;

        Ok(flow)
    }

    /// Sets a new status and appends its flow through the same executor.
    pub async fn change_state(
        &mut self,
        state_name: &str,
        remark: &str,
        exec: &mut dyn ScriptExecutor,
    ) -> Result<(), StoreError> {
        if self.id.is_empty() {
            return Err(StoreError::MissingOwner("subscription id"));
        }

        let now = unix_now();
        exec.exec_script(
            "ChangeSubscriptionState",
            &[
                state_name.into(),
                now.into(),
                format_time(now).into(),
                self.id.as_str().into(),
            ],
        )
        .await?;

        self.state_name = state_name.to_owned();
        self.last_modify_time = now;
        self.append_flow(remark, exec).await?;

        Ok(())
    }

    /// Status history of this subscription, oldest first.
    pub async fn fetch_flows(&self, exec: &mut dyn ScriptExecutor) -> Result<Vec<Flow>, StoreError> {
        exec.query_script("FetchFlows", &[self.id.as_str().into()])
            .await?
            .iter()
            .map(Flow::from_row)
            .collect()
    }

    /// Loads and row-locks the subscription of `message_id` for `receiver_tag`.
    pub async fn find_one_locked(
        message_id: &str,
        receiver_tag: &str,
        exec: &mut dyn ScriptExecutor,
    ) -> Result<Option<Subscription>, StoreError> {
        exec.query_script_row(
            "FindOneLockedSubscription",
            &[message_id.into(), receiver_tag.into()],
        )
        .await?
        .as_ref()
        .map(Subscription::from_row)
        .transpose()
    }

    pub fn is_scheduled(&self) -> bool {
        self.state_name == SUBSCRIPTION_SCHEDULED
    }
}

/// Audit row of one subscription status change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flow {
    pub id: String,
    pub subscription_id: String,
    pub state_name: String,
    pub remark: Option<String>,
    pub creation_time: i64,
}

impl Flow {
    pub fn from_row(row: &Row) -> Result<Flow, StoreError> {
        let remark = row.text("remark")?;

        Ok(Flow {
            id: row.text("id")?,
            subscription_id: row.text("subscription_id")?,
            state_name: row.text("state_name")?,
            remark: (!remark.is_empty()).then_some(remark),
            creation_time: row.int("creation_time")?,
        })
    }

    pub async fn append(&mut self, exec: &mut dyn ScriptExecutor) -> Result<(), StoreError> {
        if self.subscription_id.is_empty() {
            return Err(StoreError::MissingOwner("subscription id"));
        }
        if self.id.is_empty() {
            self.id = new_ordered_id();
        }
        if self.creation_time == 0 {
            self.creation_time = unix_now();
        }

        exec.exec_script(
            "InsertFlow",
            &[
                self.id.as_str().into(),
                self.subscription_id.as_str().into(),
                self.state_name.as_str().into(),
                self.remark.as_deref().into(),
                self.creation_time.into(),
                format_time(self.creation_time).into(),
            ],
        )
        .await?;

        Ok(())
    }
}
