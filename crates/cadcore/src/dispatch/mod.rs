//! Computer-aided dispatch domain: incidents, calls and unit statuses.
//!
//! Every command is expressed as a [`DispatchAction`], handled by the single
//! [`DispatchHandler`], and recorded as one [`CadEvent`]. Lock keys use the
//! kinds [`INCIDENT`], [`CALL`] and [`UNIT`].

mod handler;
mod model;

pub use handler::{
    DispatchAction, DispatchCommand, DispatchHandler, DispatchOutcome, Receipt, MAX_PRIORITY,
    MIN_PRIORITY,
};
pub use model::{
    call_key, incident_key, unit_key, CadEvent, Call, Incident, IncidentStatus, OperationalState,
    Unit, UnitStatus, CALL, INCIDENT, UNIT,
};
