//! Facts and intents.
//!
//! - [`Command`] = intent, transient, lives for one `handle` call
//! - [`DomainEvent`] = fact, immutable, written to the log exactly once

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::ids::{CommandId, EventId};

/// An intent to mutate operational state.
///
/// Payload fields live on the implementing type.
pub trait Command: Send + Sync {
    fn command_id(&self) -> CommandId;
}

/// A recorded fact wrapping a domain payload.
///
/// Fields are private so an event cannot be altered after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent<P> {
    event_id: EventId,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    caused_by: Option<CommandId>,
    payload: P,
}

impl<P> DomainEvent<P> {
    /// Event produced in response to a command.
    pub fn caused_by(command_id: CommandId, clock: &dyn Clock, payload: P) -> Self {
        Self {
            event_id: EventId::new(),
            timestamp: clock.now(),
            caused_by: Some(command_id),
            payload,
        }
    }

    /// Event generated by the system itself, with no originating command.
    pub fn system(clock: &dyn Clock, payload: P) -> Self {
        Self {
            event_id: EventId::new(),
            timestamp: clock.now(),
            caused_by: None,
            payload,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn cause(&self) -> Option<CommandId> {
        self.caused_by
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }
}
