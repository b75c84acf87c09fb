// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Data Model
//!
//! Entities persisted by the relay and the operations that keep their audit
//! trail consistent:
//!
//! - [`Message`] and its [`MessageLog`] (one row per state transition)
//! - [`Subscription`] and its [`Flow`] (one row per status change)
//! - [`Job`]: the background/delay descriptor of a scheduled message
//! - [`SubTemplate`]: a named default subscriber set
//!
//! Every write goes through a [`ScriptExecutor`](crate::store::ScriptExecutor)
//! supplied by the caller, so it joins the caller's transaction.

mod job;
mod message;
mod state;
mod subscription;
mod template;

pub use job::{Job, JobExtension, JobKind};
pub use message::{ExtensionHandler, Message, MessageLog};
pub use state::MessageState;
pub use subscription::{Flow, Subscription, SUBSCRIPTION_PUBLISHED, SUBSCRIPTION_SCHEDULED};
pub use template::{SubTemplate, SubTemplateDetail};

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Returns a new time-sortable identifier (UUIDv7, hex without dashes).
pub fn new_ordered_id() -> String {
    Uuid::now_v7().simple().to_string()
}

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// RFC 3339 rendering stored next to every unix timestamp column.
pub fn format_time(secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_ids_sort_by_creation() {
        let first = new_ordered_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = new_ordered_id();

        assert_eq!(first.len(), 32);
        assert!(first < second);
    }

    #[test]
    fn formats_unix_seconds() {
        assert_eq!(format_time(0), "1970-01-01T00:00:00+00:00");
    }
}
