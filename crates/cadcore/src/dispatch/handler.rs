//! Dispatch commands and the handler that validates them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::model::{
    call_key, incident_key, unit_key, CadEvent, IncidentStatus, OperationalState, UnitStatus,
};
use crate::clock::Clock;
use crate::error::ValidationError;
use crate::event::{Command, DomainEvent};
use crate::handler::CommandHandler;
use crate::ids::{CommandId, EventId};
use crate::lock::LockScope;
use crate::mutation::PendingMutation;
use crate::sequence::SequenceNumber;
use crate::state::SharedState;

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 5;

/// What a dispatcher asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DispatchAction {
    OpenIncident {
        incident_id: String,
        nature: String,
        priority: u8,
    },
    /// `clearing_units` must name exactly the units assigned at close time.
    CloseIncident {
        incident_id: String,
        clearing_units: Vec<String>,
    },
    ReceiveCall {
        call_id: String,
        summary: String,
    },
    LinkCall {
        call_id: String,
        incident_id: String,
    },
    ChangeUnitStatus {
        unit_id: String,
        status: UnitStatus,
    },
    AssignUnit {
        unit_id: String,
        incident_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchCommand {
    pub command_id: CommandId,
    pub action: DispatchAction,
}

impl DispatchCommand {
    pub fn new(action: DispatchAction) -> Self {
        Self {
            command_id: CommandId::new(),
            action,
        }
    }

    pub fn open_incident(incident_id: &str, nature: &str, priority: u8) -> Self {
        Self::new(DispatchAction::OpenIncident {
            incident_id: incident_id.to_string(),
            nature: nature.to_string(),
            priority,
        })
    }

    pub fn close_incident(incident_id: &str, clearing_units: &[&str]) -> Self {
        Self::new(DispatchAction::CloseIncident {
            incident_id: incident_id.to_string(),
            clearing_units: clearing_units.iter().map(|u| u.to_string()).collect(),
        })
    }

    pub fn receive_call(call_id: &str, summary: &str) -> Self {
        Self::new(DispatchAction::ReceiveCall {
            call_id: call_id.to_string(),
            summary: summary.to_string(),
        })
    }

    pub fn link_call(call_id: &str, incident_id: &str) -> Self {
        Self::new(DispatchAction::LinkCall {
            call_id: call_id.to_string(),
            incident_id: incident_id.to_string(),
        })
    }

    pub fn change_unit_status(unit_id: &str, status: UnitStatus) -> Self {
        Self::new(DispatchAction::ChangeUnitStatus {
            unit_id: unit_id.to_string(),
            status,
        })
    }

    pub fn assign_unit(unit_id: &str, incident_id: &str) -> Self {
        Self::new(DispatchAction::AssignUnit {
            unit_id: unit_id.to_string(),
            incident_id: incident_id.to_string(),
        })
    }
}

impl Command for DispatchCommand {
    fn command_id(&self) -> CommandId {
        self.command_id
    }
}

/// Where a handled command landed in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub command_id: CommandId,
    pub event_id: EventId,
    pub sequence: SequenceNumber,
    pub recorded_at: DateTime<Utc>,
}

/// Result of a handled dispatch command, one variant per action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    IncidentOpened {
        incident_id: String,
        receipt: Receipt,
    },
    IncidentClosed {
        incident_id: String,
        cleared_units: Vec<String>,
        receipt: Receipt,
    },
    CallReceived {
        call_id: String,
        receipt: Receipt,
    },
    CallLinked {
        call_id: String,
        incident_id: String,
        receipt: Receipt,
    },
    UnitStatusChanged {
        unit_id: String,
        status: UnitStatus,
        receipt: Receipt,
    },
    UnitAssigned {
        unit_id: String,
        incident_id: String,
        receipt: Receipt,
    },
}

impl DispatchOutcome {
    pub fn receipt(&self) -> &Receipt {
        match self {
            DispatchOutcome::IncidentOpened { receipt, .. }
            | DispatchOutcome::IncidentClosed { receipt, .. }
            | DispatchOutcome::CallReceived { receipt, .. }
            | DispatchOutcome::CallLinked { receipt, .. }
            | DispatchOutcome::UnitStatusChanged { receipt, .. }
            | DispatchOutcome::UnitAssigned { receipt, .. } => receipt,
        }
    }
}

/// Validates dispatch commands against live operational state.
#[derive(Clone)]
pub struct DispatchHandler {
    state: SharedState<OperationalState>,
    clock: Arc<dyn Clock>,
}

impl DispatchHandler {
    pub fn new(state: SharedState<OperationalState>, clock: Arc<dyn Clock>) -> Self {
        Self { state, clock }
    }

    pub fn state(&self) -> &SharedState<OperationalState> {
        &self.state
    }

    fn validate(
        state: &OperationalState,
        action: &DispatchAction,
    ) -> Result<CadEvent, ValidationError> {
        match action {
            DispatchAction::OpenIncident {
                incident_id,
                nature,
                priority,
            } => {
                if state.incident(incident_id).is_some() {
                    return Err(reject(format!("incident {incident_id} already exists")));
                }
                if nature.trim().is_empty() {
                    return Err(reject("incident nature is required"));
                }
                if !(MIN_PRIORITY..=MAX_PRIORITY).contains(priority) {
                    return Err(reject(format!(
                        "priority must be {MIN_PRIORITY}..={MAX_PRIORITY}, got {priority}"
                    )));
                }
                Ok(CadEvent::IncidentOpened {
                    incident_id: incident_id.clone(),
                    nature: nature.clone(),
                    priority: *priority,
                })
            }
            DispatchAction::CloseIncident {
                incident_id,
                clearing_units,
            } => {
                require_open_incident(state, incident_id)?;
                let assigned = state.units_assigned_to(incident_id);
                let mut clearing = clearing_units.clone();
                clearing.sort();
                clearing.dedup();
                if clearing != assigned {
                    return Err(reject(format!(
                        "incident {incident_id} has units {assigned:?} assigned, \
                         close named {clearing:?}"
                    )));
                }
                Ok(CadEvent::IncidentClosed {
                    incident_id: incident_id.clone(),
                    cleared_units: assigned,
                })
            }
            DispatchAction::ReceiveCall { call_id, summary } => {
                if state.call(call_id).is_some() {
                    return Err(reject(format!("call {call_id} already exists")));
                }
                if summary.trim().is_empty() {
                    return Err(reject("call summary is required"));
                }
                Ok(CadEvent::CallReceived {
                    call_id: call_id.clone(),
                    summary: summary.clone(),
                })
            }
            DispatchAction::LinkCall {
                call_id,
                incident_id,
            } => {
                let call = state
                    .call(call_id)
                    .ok_or_else(|| reject(format!("unknown call {call_id}")))?;
                require_open_incident(state, incident_id)?;
                if let Some(linked) = &call.incident {
                    return Err(reject(format!("call {call_id} is already linked to {linked}")));
                }
                Ok(CadEvent::CallLinked {
                    call_id: call_id.clone(),
                    incident_id: incident_id.clone(),
                })
            }
            DispatchAction::ChangeUnitStatus { unit_id, status } => {
                match status {
                    UnitStatus::Dispatched => {
                        return Err(reject("units are dispatched by assignment"));
                    }
                    UnitStatus::Enroute | UnitStatus::OnScene => {
                        let assigned = state.unit(unit_id).and_then(|unit| unit.incident.as_ref());
                        if assigned.is_none() {
                            return Err(reject(format!(
                                "unit {unit_id} cannot be {status} without an assignment"
                            )));
                        }
                    }
                    UnitStatus::Available | UnitStatus::OutOfService => {}
                }
                Ok(CadEvent::UnitStatusChanged {
                    unit_id: unit_id.clone(),
                    status: *status,
                })
            }
            DispatchAction::AssignUnit {
                unit_id,
                incident_id,
            } => {
                require_open_incident(state, incident_id)?;
                if let Some(unit) = state.unit(unit_id) {
                    if unit.status == UnitStatus::OutOfService {
                        return Err(reject(format!("unit {unit_id} is out of service")));
                    }
                    if let Some(current) = &unit.incident {
                        return Err(reject(format!(
                            "unit {unit_id} is already assigned to {current}"
                        )));
                    }
                }
                Ok(CadEvent::UnitAssigned {
                    unit_id: unit_id.clone(),
                    incident_id: incident_id.clone(),
                })
            }
        }
    }
}

fn reject(message: impl Into<String>) -> ValidationError {
    ValidationError::new(message)
}

fn require_open_incident(
    state: &OperationalState,
    incident_id: &str,
) -> Result<(), ValidationError> {
    match state.incident(incident_id) {
        None => Err(reject(format!("unknown incident {incident_id}"))),
        Some(incident) if incident.status == IncidentStatus::Closed => {
            Err(reject(format!("incident {incident_id} is closed")))
        }
        Some(_) => Ok(()),
    }
}

#[async_trait]
impl CommandHandler for DispatchHandler {
    type Command = DispatchCommand;
    type Payload = CadEvent;
    type Output = DispatchOutcome;

    fn determine_lock_scope(&self, command: &DispatchCommand) -> LockScope {
        match &command.action {
            DispatchAction::OpenIncident { incident_id, .. } => {
                LockScope::single(incident_key(incident_id))
            }
            DispatchAction::CloseIncident {
                incident_id,
                clearing_units,
            } => {
                LockScope::of(
                    incident_key(incident_id),
                    clearing_units.iter().map(|unit| unit_key(unit)),
                )
            }
            DispatchAction::ReceiveCall { call_id, .. } => LockScope::single(call_key(call_id)),
            DispatchAction::LinkCall {
                call_id,
                incident_id,
            } => LockScope::of(call_key(call_id), [incident_key(incident_id)]),
            DispatchAction::ChangeUnitStatus { unit_id, .. } => {
                LockScope::single(unit_key(unit_id))
            }
            DispatchAction::AssignUnit {
                unit_id,
                incident_id,
            } => LockScope::of(unit_key(unit_id), [incident_key(incident_id)]),
        }
    }

    async fn prepare_execution(
        &self,
        command: &DispatchCommand,
    ) -> Result<PendingMutation<CadEvent>, ValidationError> {
        let payload = self
            .state
            .read(|state| Self::validate(state, &command.action))?;
        let event = DomainEvent::caused_by(command.command_id, self.clock.as_ref(), payload);
        Ok(self.state.defer(event))
    }

    fn build_result(
        &self,
        command: &DispatchCommand,
        event: &DomainEvent<CadEvent>,
        sequence: SequenceNumber,
    ) -> DispatchOutcome {
        let receipt = Receipt {
            command_id: command.command_id,
            event_id: event.event_id(),
            sequence,
            recorded_at: event.timestamp(),
        };
        match event.payload().clone() {
            CadEvent::IncidentOpened { incident_id, .. } => {
                DispatchOutcome::IncidentOpened { incident_id, receipt }
            }
            CadEvent::IncidentClosed {
                incident_id,
                cleared_units,
            } => DispatchOutcome::IncidentClosed {
                incident_id,
                cleared_units,
                receipt,
            },
            CadEvent::CallReceived { call_id, .. } => {
                DispatchOutcome::CallReceived { call_id, receipt }
            }
            CadEvent::CallLinked {
                call_id,
                incident_id,
            } => DispatchOutcome::CallLinked {
                call_id,
                incident_id,
                receipt,
            },
            CadEvent::UnitStatusChanged { unit_id, status } => DispatchOutcome::UnitStatusChanged {
                unit_id,
                status,
                receipt,
            },
            CadEvent::UnitAssigned {
                unit_id,
                incident_id,
            } => DispatchOutcome::UnitAssigned {
                unit_id,
                incident_id,
                receipt,
            },
        }
    }
}
