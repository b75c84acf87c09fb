// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use super::{new_ordered_id, unix_now, ExtensionHandler};
use crate::{
    errors::StoreError,
    payload::JobRequest,
    store::{Row, ScriptExecutor},
};
use async_trait::async_trait;
use std::fmt;

/// Kind of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Delivered as soon as it is persisted
    BackgroundJob = 1,
    /// Delivered once its delay has elapsed
    DelayJob = 2,
}

impl JobKind {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> JobKind {
        if code == JobKind::BackgroundJob.code() {
            JobKind::BackgroundJob
        } else {
            JobKind::DelayJob
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            JobKind::BackgroundJob => "BackgroundJob",
            JobKind::DelayJob => "DelayJob",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Background or delay job persisted next to its message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub message_id: String,
    pub expression: String,
    pub kind: JobKind,
    pub delay_seconds: i64,
    pub creation_time: i64,
}

impl Job {
    /// Builds the job of `message_id`; any non-zero delay makes it a
    /// [`JobKind::DelayJob`]. A delay that does not fit a signed 64-bit
    /// column is rejected.
    pub fn for_request(message_id: &str, request: &JobRequest) -> Result<Job, StoreError> {
        let kind = if request.delay.is_immediate() {
            JobKind::BackgroundJob
        } else {
            JobKind::DelayJob
        };

        let delay_seconds = i64::try_from(request.delay.seconds).map_err(|_| {
            StoreError::Validation(format!(
                "delay of {} seconds is out of range",
                request.delay.seconds
            ))
        })?;

        Ok(Job {
            id: String::new(),
            message_id: message_id.to_owned(),
            expression: request.expression.clone(),
            kind,
            delay_seconds,
            creation_time: 0,
        })
    }

    pub fn from_row(row: &Row) -> Result<Job, StoreError> {
        Ok(Job {
            id: row.text("id")?,
            message_id: row.text("message_id")?,
            expression: row.text("expression")?,
            kind: JobKind::from_code(row.int("kind")?),
            delay_seconds: row.int("delay_seconds")?,
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
            "InsertBackgroundJob",
            &[
                self.id.as_str().into(),
                self.message_id.as_str().into(),
                self.expression.as_str().into(),
                self.kind.code().into(),
                self.kind.name().into(),
                self.delay_seconds.into(),
                self.creation_time.into(),
            ],
        )
        .await?;

        Ok(())
    }

    pub async fn find_by_message(
        message_id: &str,
        exec: &mut dyn ScriptExecutor,
    ) -> Result<Option<Job>, StoreError> {
        exec.query_script_row("FindBackgroundJob", &[message_id.into()])
            .await?
            .as_ref()
            .map(Job::from_row)
            .transpose()
    }
}

/// Extension handler persisting the job row of an ingested message.
#[derive(Debug, Clone)]
pub struct JobExtension {
    request: JobRequest,
}

impl JobExtension {
    pub fn new(request: JobRequest) -> JobExtension {
        JobExtension { request }
    }
}

#[async_trait]
impl ExtensionHandler for JobExtension {
    async fn handle(
        &self,
        message_id: &str,
        exec: &mut dyn ScriptExecutor,
    ) -> Result<(), StoreError> {
        Job::for_request(message_id, &self.request)?
            .append(exec)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        payload::DelayRequest,
        store::{memory::MemoryStore, Store},
    };

    fn request(seconds: u64) -> JobRequest {
        JobRequest {
            delay: DelayRequest { seconds },
            expression: format!("now + {seconds} seconds"),
        }
    }

    #[test]
    fn non_zero_delay_is_a_delay_job() {
        assert_eq!(
            Job::for_request("m", &request(0)).unwrap().kind,
            JobKind::BackgroundJob
        );
        assert_eq!(Job::for_request("m", &request(5)).unwrap().kind, JobKind::DelayJob);
        assert_eq!(JobKind::from_code(2), JobKind::DelayJob);
    }

    #[test]
    fn out_of_range_delay_is_rejected() {
        let err = Job::for_request("m", &request(u64::MAX)).unwrap_err();

        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn extension_persists_the_job() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();

        JobExtension::new(request(5))
            .handle("m1", tx.executor())
            .await
            .unwrap();

        let job = Job::find_by_message("m1", tx.executor())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.kind, JobKind::DelayJob);
        assert_eq!(job.delay_seconds, 5);
        assert_eq!(job.expression, "now + 5 seconds");
    }

    #[tokio::test]
    async fn job_requires_its_message() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();

        let err = JobExtension::new(request(0))
            .handle("", tx.executor())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingOwner(_)));
    }
}
