//! Operational state: incidents, calls and unit statuses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::event::DomainEvent;
use crate::lock::LockKey;
use crate::state::EventSourced;

pub const INCIDENT: &str = "incident";
pub const CALL: &str = "call";
pub const UNIT: &str = "unit";

pub fn incident_key(id: &str) -> LockKey {
    LockKey::new(INCIDENT, id)
}

pub fn call_key(id: &str) -> LockKey {
    LockKey::new(CALL, id)
}

pub fn unit_key(id: &str) -> LockKey {
    LockKey::new(UNIT, id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Available,
    Dispatched,
    Enroute,
    OnScene,
    OutOfService,
}

impl UnitStatus {
    /// Statuses that end any incident assignment.
    pub fn clears_assignment(self) -> bool {
        matches!(self, UnitStatus::Available | UnitStatus::OutOfService)
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitStatus::Available => "available",
            UnitStatus::Dispatched => "dispatched",
            UnitStatus::Enroute => "enroute",
            UnitStatus::OnScene => "on_scene",
            UnitStatus::OutOfService => "out_of_service",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub nature: String,
    pub priority: u8,
    pub status: IncidentStatus,
    pub opened_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub linked_calls: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub id: String,
    pub summary: String,
    pub received_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incident: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub id: String,
    pub status: UnitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incident: Option<String>,
    pub changed_at: DateTime<Utc>,
}

/// Facts recorded by dispatch commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CadEvent {
    IncidentOpened {
        incident_id: String,
        nature: String,
        priority: u8,
    },
    IncidentClosed {
        incident_id: String,
        cleared_units: Vec<String>,
    },
    CallReceived {
        call_id: String,
        summary: String,
    },
    CallLinked {
        call_id: String,
        incident_id: String,
    },
    UnitStatusChanged {
        unit_id: String,
        status: UnitStatus,
    },
    UnitAssigned {
        unit_id: String,
        incident_id: String,
    },
}

/// All live incidents, calls and unit statuses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationalState {
    #[serde(default)]
    pub incidents: BTreeMap<String, Incident>,
    #[serde(default)]
    pub calls: BTreeMap<String, Call>,
    #[serde(default)]
    pub units: BTreeMap<String, Unit>,
}

impl OperationalState {
    pub fn incident(&self, id: &str) -> Option<&Incident> {
        self.incidents.get(id)
    }

    pub fn call(&self, id: &str) -> Option<&Call> {
        self.calls.get(id)
    }

    pub fn unit(&self, id: &str) -> Option<&Unit> {
        self.units.get(id)
    }

    /// Ids of units currently assigned to `incident_id`, sorted.
    pub fn units_assigned_to(&self, incident_id: &str) -> Vec<String> {
        self.units
            .values()
            .filter(|unit| unit.incident.as_deref() == Some(incident_id))
            .map(|unit| unit.id.clone())
            .collect()
    }

    fn set_unit(
        &mut self,
        unit_id: &str,
        status: UnitStatus,
        incident: Option<String>,
        at: DateTime<Utc>,
    ) {
        let unit = self.units.entry(unit_id.to_string()).or_insert_with(|| Unit {
            id: unit_id.to_string(),
            status,
            incident: None,
            changed_at: at,
        });
        unit.status = status;
        unit.incident = incident;
        unit.changed_at = at;
    }
}

impl EventSourced for OperationalState {
    type Payload = CadEvent;

    fn apply(&mut self, event: &DomainEvent<CadEvent>) {
        let at = event.timestamp();
        match event.payload() {
            CadEvent::IncidentOpened {
                incident_id,
                nature,
                priority,
            } => {
                self.incidents.insert(
                    incident_id.clone(),
                    Incident {
                        id: incident_id.clone(),
                        nature: nature.clone(),
                        priority: *priority,
                        status: IncidentStatus::Open,
                        opened_at: at,
                        closed_at: None,
                        linked_calls: BTreeSet::new(),
                    },
                );
            }
            CadEvent::IncidentClosed {
                incident_id,
                cleared_units,
            } => {
                if let Some(incident) = self.incidents.get_mut(incident_id) {
                    incident.status = IncidentStatus::Closed;
                    incident.closed_at = Some(at);
                }
                for unit_id in cleared_units {
                    self.set_unit(unit_id, UnitStatus::Available, None, at);
                }
            }
            CadEvent::CallReceived { call_id, summary } => {
                self.calls.insert(
                    call_id.clone(),
                    Call {
                        id: call_id.clone(),
                        summary: summary.clone(),
                        received_at: at,
                        incident: None,
                    },
                );
            }
            CadEvent::CallLinked {
                call_id,
                incident_id,
            } => {
                if let Some(call) = self.calls.get_mut(call_id) {
                    call.incident = Some(incident_id.clone());
                }
                if let Some(incident) = self.incidents.get_mut(incident_id) {
                    incident.linked_calls.insert(call_id.clone());
                }
            }
            CadEvent::UnitStatusChanged { unit_id, status } => {
                let incident = if status.clears_assignment() {
                    None
                } else {
                    self.units.get(unit_id).and_then(|unit| unit.incident.clone())
                };
                self.set_unit(unit_id, *status, incident, at);
            }
            CadEvent::UnitAssigned {
                unit_id,
                incident_id,
            } => {
                self.set_unit(unit_id, UnitStatus::Dispatched, Some(incident_id.clone()), at);
            }
        }
    }
}
