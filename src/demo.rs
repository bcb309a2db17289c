//! Demonstration sequence for the simulated display controller
//!
//! Drives a [`DisplayCore`] through growth, contention between two outputs,
//! write-back capture, shrinking and a stuck producer, logging the pool and
//! the outputs after every step.

use anyhow::{Context, Result};
use log::{info, warn};
use overlay_commit::hw::sim::SimulatedHardware;
use overlay_commit::{
    CommitMode, CoreConfig, DisplayCore, Fence, OutputId, OutputKind, OutputUpdate, PlaneState,
    Transaction,
};
use std::sync::Arc;

/// Registered outputs the demo works with
struct Outputs {
    panel: OutputId,
    external: Option<OutputId>,
    writeback: Option<OutputId>,
}

pub async fn run(config: CoreConfig, hardware: Arc<SimulatedHardware>) -> Result<()> {
    let core = DisplayCore::new(config.clone(), hardware);

    let mut panel = None;
    let mut external = None;
    let mut writeback = None;
    for output in &config.outputs {
        let id = core
            .register_output(output)
            .with_context(|| format!("Failed to register output {}", output.name))?;
        let slot = match output.kind {
            OutputKind::Panel => &mut panel,
            OutputKind::External => &mut external,
            OutputKind::Writeback => &mut writeback,
        };
        slot.get_or_insert(id);
    }
    let outputs = Outputs {
        panel: panel.context("The demo needs at least one panel output")?,
        external,
        writeback,
    };

    log_snapshot(&core, "registered");

    grow(&core, &outputs).await?;
    contention(&core, &outputs).await?;
    capture(&core, &outputs).await?;
    shrink(&core, &outputs).await?;
    stuck_producer(&core, &outputs).await?;

    let stats = core.pool().stats();
    info!(
        "📊 Pool: {} acquisitions, {} failures ({:.1}%), {} releases, low water {}",
        stats.acquisitions,
        stats.failures,
        stats.failure_rate(),
        stats.releases,
        stats.low_water
    );
    Ok(())
}

fn planes(output: OutputId, count: u32) -> OutputUpdate {
    (0..count).fold(OutputUpdate::enable(output), |update, z| {
        update.plane(PlaneState::new(output.0 * 16 + z, z))
    })
}

fn max_planes(core: &DisplayCore, output: OutputId) -> u32 {
    core.outputs()
        .iter()
        .find(|info| info.id == output)
        .map(|info| info.max_windows as u32)
        .unwrap_or(1)
}

async fn grow(core: &DisplayCore, outputs: &Outputs) -> Result<()> {
    let count = max_planes(core, outputs.panel);
    info!("🎬 Step 1: panel grows to {} planes", count);
    core.submit(Transaction::new().with(planes(outputs.panel, count)), CommitMode::Blocking)
        .await?
        .wait()
        .await?;
    log_snapshot(core, "grow");
    Ok(())
}

async fn contention(core: &DisplayCore, outputs: &Outputs) -> Result<()> {
    let Some(external) = outputs.external else {
        info!("⏭️ Step 2 skipped: no external output configured");
        return Ok(());
    };

    let wanted = max_planes(core, external);
    info!(
        "🎬 Step 2: panel shrinks to 1 plane while the external output asks for {}",
        wanted
    );

    let shrink = core
        .submit(Transaction::new().with(planes(outputs.panel, 1)), CommitMode::NonBlocking)
        .await?;
    match core
        .submit(Transaction::new().with(planes(external, wanted)), CommitMode::NonBlocking)
        .await
    {
        Ok(ticket) => {
            ticket.wait().await?;
            info!("✅ External output got its windows");
        }
        Err(e) => warn!("⚠️ External output lost the race: {}", e),
    }
    shrink.wait().await?;

    log_snapshot(core, "contention");
    Ok(())
}

async fn capture(core: &DisplayCore, outputs: &Outputs) -> Result<()> {
    let Some(writeback) = outputs.writeback else {
        info!("⏭️ Step 3 skipped: no write-back output configured");
        return Ok(());
    };

    info!("🎬 Step 3: write-back captures the panel");
    let done = Fence::new();
    let txn = Transaction::new().with(
        OutputUpdate::enable(writeback)
            .writeback_source(outputs.panel)
            .out_fence(done.clone()),
    );
    core.submit(txn, CommitMode::NonBlocking).await?.wait().await?;
    if let Some(Err(e)) = done.status() {
        warn!("⚠️ Capture fence reported {}", e);
    }

    core.submit(Transaction::new().with(OutputUpdate::disable(writeback)), CommitMode::Blocking)
        .await?
        .wait()
        .await?;
    log_snapshot(core, "capture");
    Ok(())
}

async fn shrink(core: &DisplayCore, outputs: &Outputs) -> Result<()> {
    info!("🎬 Step 4: every output but the panel switches off");
    let mut txn = Transaction::new();
    for info in core.outputs() {
        if info.id != outputs.panel && core.output_state(info.id).is_some_and(|s| s.active) {
            txn.push(OutputUpdate::disable(info.id));
        }
    }
    if txn.is_empty() {
        info!("Nothing to switch off");
        return Ok(());
    }

    core.submit(txn, CommitMode::Blocking).await?.wait().await?;
    log_snapshot(core, "shrink");
    Ok(())
}

async fn stuck_producer(core: &DisplayCore, outputs: &Outputs) -> Result<()> {
    info!(
        "🎬 Step 5: panel frame waits on a producer that never signals (timeout {:?})",
        core.timing().fence_timeout()
    );
    if core.timing().fence_timeout().is_none() {
        info!("⏭️ Step 5 skipped: fence timeout is unbounded");
        return Ok(());
    }

    let stuck = Fence::new();
    let txn = Transaction::new().with(
        OutputUpdate::enable(outputs.panel).plane(PlaneState::new(0, 0).fence(stuck.clone())),
    );
    match core.submit(txn, CommitMode::Blocking).await {
        Ok(ticket) => ticket.wait().await?,
        Err(e) => warn!("⚠️ Frame dropped: {}", e),
    }

    log_snapshot(core, "stuck producer");
    Ok(())
}

fn log_snapshot(core: &DisplayCore, step: &str) {
    let snapshot = core.snapshot();
    info!("🪟 [{}] free windows {}", step, snapshot.available);
    for (id, state) in &snapshot.outputs {
        info!(
            "   output {}: active={} reserved={} visible={} freed={}",
            id, state.active, state.reserved, state.visible, state.freed_pending
        );
    }
    if let Err(e) = snapshot.check_invariants() {
        warn!("⚠️ Invariant violated after {}: {}", step, e);
    }
}
