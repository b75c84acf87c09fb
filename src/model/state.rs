// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use std::{fmt, str::FromStr};

/// Lifecycle state of a [`Message`](super::Message).
///
/// ```text
/// Unknown -> Scheduled -> Processing -> Succeeded
///                |             |
///                +-----------> Failed -> Rollback
/// ```
///
/// `Scheduled -> Failed` is taken when the delivery job exhausts its retries
/// before a single publish went through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MessageState {
    /// Persisted, waiting for its first successful delivery attempt
    Scheduled,
    /// Published, or armed as a delayed job; settled later by a sweeper
    Processing,
    /// Every subscription was delivered
    Succeeded,
    /// Retries ran out or a subscription never left `Scheduled`/`Failed`
    Failed,
    /// Compensation was sent to every receiver
    Rollback,
    /// Origin of the first audit row; never stored on a message
    #[default]
    Unknown,
}

impl MessageState {
    /// Persisted numeric code.
    pub fn code(self) -> i64 {
        match self {
            MessageState::Scheduled => 1,
            MessageState::Processing => 2,
            MessageState::Succeeded => 3,
            MessageState::Failed => 4,
            MessageState::Rollback => 5,
            MessageState::Unknown => 99,
        }
    }

    pub fn from_code(code: i64) -> MessageState {
        match code {
            1 => MessageState::Scheduled,
            2 => MessageState::Processing,
            3 => MessageState::Succeeded,
            4 => MessageState::Failed,
            5 => MessageState::Rollback,
            _ => MessageState::Unknown,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageState::Scheduled => "Scheduled",
            MessageState::Processing => "Processing",
            MessageState::Succeeded => "Succeeded",
            MessageState::Failed => "Failed",
            MessageState::Rollback => "Rollback",
            MessageState::Unknown => "Unknown",
        }
    }

    pub fn can_transition_to(self, next: MessageState) -> bool {
        matches!(
            (self, next),
            (MessageState::Unknown, MessageState::Scheduled)
                | (MessageState::Scheduled, MessageState::Processing)
                | (MessageState::Scheduled, MessageState::Failed)
                | (MessageState::Processing, MessageState::Succeeded)
                | (MessageState::Processing, MessageState::Failed)
                | (MessageState::Failed, MessageState::Rollback)
        )
    }

    /// States in which no further delivery attempt may publish.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            MessageState::Succeeded | MessageState::Failed | MessageState::Rollback
        )
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MessageState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Scheduled" => Ok(MessageState::Scheduled),
            "Processing" => Ok(MessageState::Processing),
            "Succeeded" => Ok(MessageState::Succeeded),
            "Failed" => Ok(MessageState::Failed),
            "Rollback" => Ok(MessageState::Rollback),
            "Unknown" => Ok(MessageState::Unknown),
            other => Err(format!("message state '{other}' unrecognizable")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [MessageState; 6] = [
        MessageState::Scheduled,
        MessageState::Processing,
        MessageState::Succeeded,
        MessageState::Failed,
        MessageState::Rollback,
        MessageState::Unknown,
    ];

    #[test]
    fn only_unknown_enters_scheduled() {
        for from in ALL {
            assert_eq!(
                from.can_transition_to(MessageState::Scheduled),
                from == MessageState::Unknown,
                "{from} -> Scheduled"
            );
        }
    }

    #[test]
    fn rollback_is_only_reachable_from_failed() {
        for from in ALL {
            assert_eq!(
                from.can_transition_to(MessageState::Rollback),
                from == MessageState::Failed
            );
        }
    }

    #[test]
    fn terminal_states_have_no_exit_except_failed() {
        for to in ALL {
            assert!(!MessageState::Succeeded.can_transition_to(to));
            assert!(!MessageState::Rollback.can_transition_to(to));
        }
    }

    #[test]
    fn codes_and_names_are_stable() {
        for state in ALL {
            assert_eq!(MessageState::from_code(state.code()), state);
            assert_eq!(state.name().parse::<MessageState>().unwrap(), state);
        }
        assert_eq!(MessageState::from_code(42), MessageState::Unknown);
        assert!("Delivered".parse::<MessageState>().is_err());
    }
}
