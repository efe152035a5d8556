//! A small counter domain shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use cadcore::{
    Clock, Command, CommandHandler, CommandId, CommandPipeline, DomainEvent, EventSourced,
    LockKey, LockScope, PendingMutation, SequenceNumber, SharedState, SystemClock,
    ValidationError,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Barrier;

pub const COUNTER: &str = "counter";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjusted {
    pub counter: String,
    pub delta: i64,
}

/// Counters by name, folded from [`Adjusted`] events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub counters: BTreeMap<String, i64>,
    pub applied: u64,
}

impl EventSourced for Tally {
    type Payload = Adjusted;

    fn apply(&mut self, event: &DomainEvent<Adjusted>) {
        let adjusted = event.payload();
        *self.counters.entry(adjusted.counter.clone()).or_default() += adjusted.delta;
        self.applied += 1;
    }
}

#[derive(Debug, Clone)]
pub struct Adjust {
    pub command_id: CommandId,
    pub counters: Vec<String>,
    pub delta: i64,
}

impl Adjust {
    pub fn new(counter: &str, delta: i64) -> Self {
        Self::across(&[counter], delta)
    }

    /// One command whose scope covers several counters. Only the first is adjusted.
    pub fn across(counters: &[&str], delta: i64) -> Self {
        Self {
            command_id: CommandId::new(),
            counters: counters.iter().map(|c| c.to_string()).collect(),
            delta,
        }
    }
}

impl Command for Adjust {
    fn command_id(&self) -> CommandId {
        self.command_id
    }
}

/// Ordered record of what each command did, for interleaving checks.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    steps: Arc<Mutex<Vec<(CommandId, &'static str)>>>,
}

impl Trace {
    pub fn record(&self, command_id: CommandId, step: &'static str) {
        self.steps.lock().unwrap().push((command_id, step));
    }

    pub fn steps(&self) -> Vec<(CommandId, &'static str)> {
        self.steps.lock().unwrap().clone()
    }
}

/// Handler for [`Adjust`], with optional probes.
#[derive(Clone)]
pub struct TallyHandler {
    pub state: SharedState<Tally>,
    pub clock: Arc<dyn Clock>,
    pub trace: Trace,
    /// Every prepare waits here when set.
    pub barrier: Option<Arc<Barrier>>,
    /// Negative deltas are rejected when set.
    pub reject_negative: bool,
}

impl TallyHandler {
    pub fn new(state: SharedState<Tally>) -> Self {
        Self {
            state,
            clock: Arc::new(SystemClock),
            trace: Trace::default(),
            barrier: None,
            reject_negative: false,
        }
    }

    pub fn with_barrier(mut self, barrier: Arc<Barrier>) -> Self {
        self.barrier = Some(barrier);
        self
    }

    pub fn rejecting_negative(mut self) -> Self {
        self.reject_negative = true;
        self
    }
}

#[async_trait]
impl CommandHandler for TallyHandler {
    type Command = Adjust;
    type Payload = Adjusted;
    type Output = SequenceNumber;

    fn determine_lock_scope(&self, command: &Adjust) -> LockScope {
        LockScope::new(
            command
                .counters
                .iter()
                .map(|counter| LockKey::new(COUNTER, counter.as_str())),
        )
        .unwrap()
    }

    async fn prepare_execution(
        &self,
        command: &Adjust,
    ) -> Result<PendingMutation<Adjusted>, ValidationError> {
        self.trace.record(command.command_id, "prepare");
        if let Some(barrier) = &self.barrier {
            barrier.wait().await;
        }
        tokio::task::yield_now().await;
        if self.reject_negative && command.delta < 0 {
            return Err(ValidationError::new("negative delta"));
        }

        let event = DomainEvent::caused_by(
            command.command_id,
            self.clock.as_ref(),
            Adjusted {
                counter: command.counters[0].clone(),
                delta: command.delta,
            },
        );
        let state = self.state.clone();
        let trace = self.trace.clone();
        let applied = event.clone();
        let command_id = command.command_id;
        Ok(PendingMutation::new(event, move || {
            trace.record(command_id, "apply");
            state.apply(&applied);
        }))
    }

    fn build_result(
        &self,
        _command: &Adjust,
        _event: &DomainEvent<Adjusted>,
        sequence: SequenceNumber,
    ) -> SequenceNumber {
        sequence
    }
}

pub type TallyPipeline = CommandPipeline<Adjusted>;
