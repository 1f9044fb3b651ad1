//! Event Positions
//!
//! A position tells a partition receiver where to start reading. Offset and
//! sequence number positions built through the constructors are exclusive:
//! reading starts at the first event *after* the given one, which is what a
//! checkpoint resume needs.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventPosition {
    /// First event still retained in the partition
    Earliest,
    /// Only events enqueued after the receiver opens
    #[default]
    Latest,
    Offset { offset: i64, inclusive: bool },
    SequenceNumber { sequence_number: i64, inclusive: bool },
    /// First event enqueued after this time (milliseconds since epoch)
    EnqueuedTime(i64),
}

impl EventPosition {
    /// Exclusive position after the event with this offset
    pub fn from_offset(offset: i64) -> Self {
        EventPosition::Offset {
            offset,
            inclusive: false,
        }
    }

    /// Exclusive position after the event with this sequence number
    pub fn from_sequence_number(sequence_number: i64) -> Self {
        EventPosition::SequenceNumber {
            sequence_number,
            inclusive: false,
        }
    }

    pub fn from_sequence_number_inclusive(sequence_number: i64) -> Self {
        EventPosition::SequenceNumber {
            sequence_number,
            inclusive: true,
        }
    }

    pub fn from_enqueued_time(enqueued_time_ms: i64) -> Self {
        EventPosition::EnqueuedTime(enqueued_time_ms)
    }
}

impl fmt::Display for EventPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventPosition::Earliest => write!(f, "earliest"),
            EventPosition::Latest => write!(f, "latest"),
            EventPosition::Offset { offset, inclusive } => {
                write!(f, "offset {} ({})", offset, inclusivity(*inclusive))
            }
            EventPosition::SequenceNumber {
                sequence_number,
                inclusive,
            } => write!(
                f,
                "sequence number {} ({})",
                sequence_number,
                inclusivity(*inclusive)
            ),
            EventPosition::EnqueuedTime(t) => write!(f, "enqueued after {}", t),
        }
    }
}

fn inclusivity(inclusive: bool) -> &'static str {
    if inclusive {
        "inclusive"
    } else {
        "exclusive"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_are_exclusive() {
        assert_eq!(
            EventPosition::from_offset(42),
            EventPosition::Offset {
                offset: 42,
                inclusive: false
            }
        );
        assert_eq!(
            EventPosition::from_sequence_number(7),
            EventPosition::SequenceNumber {
                sequence_number: 7,
                inclusive: false
            }
        );
    }

    #[test]
    fn test_default_is_latest() {
        assert_eq!(EventPosition::default(), EventPosition::Latest);
    }

    #[test]
    fn test_display() {
        assert_eq!(EventPosition::Earliest.to_string(), "earliest");
        assert_eq!(
            EventPosition::from_sequence_number(3).to_string(),
            "sequence number 3 (exclusive)"
        );
    }
}
