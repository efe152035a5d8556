use cadcore::dispatch::{
    CadEvent, DispatchCommand, DispatchHandler, DispatchOutcome, IncidentStatus,
    OperationalState, UnitStatus,
};
use cadcore::{recover, CommandError, CommandPipeline, EntityLockManager, SharedState, WalPort};
use cadcore_testing::{InMemorySnapshotStore, InMemoryWal, ManualClock};
use std::sync::Arc;

struct Center {
    wal: Arc<InMemoryWal<CadEvent>>,
    pipeline: CommandPipeline<CadEvent>,
    handler: DispatchHandler,
    clock: Arc<ManualClock>,
}

impl Center {
    fn new() -> Self {
        let wal = Arc::new(InMemoryWal::<CadEvent>::new());
        let clock = Arc::new(ManualClock::at_epoch());
        Self {
            pipeline: CommandPipeline::new(EntityLockManager::new(), wal.clone()),
            handler: DispatchHandler::new(SharedState::default(), clock.clone()),
            wal,
            clock,
        }
    }

    async fn run(&self, command: DispatchCommand) -> Result<DispatchOutcome, CommandError> {
        self.clock.advance(chrono::Duration::seconds(30));
        self.pipeline.handle(&self.handler, command).await
    }

    fn state(&self) -> OperationalState {
        self.handler.state().capture()
    }
}

#[tokio::test]
async fn incident_lifecycle_end_to_end() -> anyhow::Result<()> {
    let center = Center::new();

    center.run(DispatchCommand::open_incident("I-7", "structure fire", 1)).await?;
    center.run(DispatchCommand::receive_call("C-1", "smoke from roof")).await?;
    center.run(DispatchCommand::link_call("C-1", "I-7")).await?;
    center.run(DispatchCommand::change_unit_status("E12", UnitStatus::Available)).await?;
    center.run(DispatchCommand::assign_unit("E12", "I-7")).await?;
    center.run(DispatchCommand::change_unit_status("E12", UnitStatus::Enroute)).await?;
    center.run(DispatchCommand::change_unit_status("E12", UnitStatus::OnScene)).await?;

    let outcome = center
        .run(DispatchCommand::close_incident("I-7", &["E12"]))
        .await?;
    match &outcome {
        DispatchOutcome::IncidentClosed { cleared_units, .. } => {
            assert_eq!(cleared_units, &vec!["E12".to_string()]);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(outcome.receipt().sequence, center.wal.current_sequence().await);

    let state = center.state();
    assert_eq!(state.incident("I-7").unwrap().status, IncidentStatus::Closed);
    assert!(state.incident("I-7").unwrap().linked_calls.contains("C-1"));
    assert_eq!(state.unit("E12").unwrap().status, UnitStatus::Available);
    assert_eq!(center.wal.len().await, 8);
    Ok(())
}

#[tokio::test]
async fn rejected_dispatch_commands_leave_no_trace() -> anyhow::Result<()> {
    let center = Center::new();
    center.run(DispatchCommand::open_incident("I-1", "medical", 2)).await?;
    let before = center.state();

    let rejected = [
        DispatchCommand::open_incident("I-1", "medical", 2),
        DispatchCommand::open_incident("I-2", "medical", 9),
        DispatchCommand::link_call("C-404", "I-1"),
        DispatchCommand::assign_unit("M1", "I-404"),
        DispatchCommand::change_unit_status("M1", UnitStatus::OnScene),
    ];
    for command in rejected {
        let err = center.run(command).await.unwrap_err();
        assert!(matches!(err, CommandError::Validation(_)), "{err}");
    }

    assert_eq!(center.state(), before);
    assert_eq!(center.wal.len().await, 1);
    Ok(())
}

#[tokio::test]
async fn receipts_carry_command_and_clock() -> anyhow::Result<()> {
    let center = Center::new();
    let command = DispatchCommand::receive_call("C-2", "alarm panel");
    let command_id = command.command_id;

    let outcome = center.run(command).await?;

    let receipt = outcome.receipt();
    assert_eq!(receipt.command_id, command_id);
    assert_eq!(receipt.recorded_at, center.state().call("C-2").unwrap().received_at);
    let entries = center.wal.entries().await;
    assert_eq!(entries[0].event.event_id(), receipt.event_id);
    assert_eq!(entries[0].event.cause(), Some(command_id));
    Ok(())
}

#[tokio::test]
async fn recovered_center_matches_live_center() -> anyhow::Result<()> {
    let center = Center::new();
    center.run(DispatchCommand::open_incident("I-3", "vehicle collision", 2)).await?;
    center.run(DispatchCommand::change_unit_status("M4", UnitStatus::Available)).await?;
    center.run(DispatchCommand::assign_unit("M4", "I-3")).await?;
    center.run(DispatchCommand::change_unit_status("M4", UnitStatus::OutOfService)).await?;

    let recovered = recover::<OperationalState>(
        center.wal.as_ref(),
        &InMemorySnapshotStore::<OperationalState>::new(),
    )
    .await?;

    assert_eq!(recovered.state, center.state());
    assert!(recovered.state.units_assigned_to("I-3").is_empty());
    Ok(())
}
