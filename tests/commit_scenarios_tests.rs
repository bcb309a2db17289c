// Commit scenario integration tests for overlay-commit
//
// Drives DisplayCore through the simulated display controller: window
// growth, contention between outputs, deferred release of freed windows,
// pending-output rejection and stuck producer fences.

use overlay_commit::hw::sim::SimulatedHardware;
use overlay_commit::hw::Completion;
use overlay_commit::{
    CommitError, CommitMode, CoreConfig, DisplayCore, Fence, FenceError, HwError, OutputConfig,
    OutputId, OutputKind, OutputUpdate, PlaneState, Transaction, ValidationError, WindowMask,
};
use std::sync::Arc;
use std::time::Duration;

fn config(windows: u8) -> CoreConfig {
    let mut config = CoreConfig::default();
    config.pool.windows = windows;
    config.outputs.clear();
    // Tests hold completions on purpose; keep the hardware timeout out of the way.
    config.timing.frame_done_timeout_ms = 5_000;
    config
}

fn setup(config: CoreConfig, outputs: &[(&str, u8)]) -> (DisplayCore, Arc<SimulatedHardware>, Vec<OutputId>) {
    let hw = Arc::new(SimulatedHardware::new());
    let core = DisplayCore::new(config, hw.clone());
    let ids = outputs
        .iter()
        .map(|(name, max)| {
            core.register_output(&OutputConfig::new(*name, OutputKind::Panel, *max).with_refresh(60))
                .unwrap()
        })
        .collect();
    (core, hw, ids)
}

fn planes(output: OutputId, count: u32) -> OutputUpdate {
    (0..count).fold(OutputUpdate::enable(output), |update, z| {
        update.plane(PlaneState::new(output.0 * 100 + z, z))
    })
}

async fn commit(core: &DisplayCore, update: OutputUpdate) {
    core.submit(Transaction::new().with(update), CommitMode::Blocking)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
}

fn assert_conserved(core: &DisplayCore) {
    if let Err(e) = core.snapshot().check_invariants() {
        panic!("{}", e);
    }
}

#[tokio::test]
async fn test_growth_takes_two_lowest_free_windows() {
    let (core, _hw, ids) = setup(config(8), &[("X", 6), ("Z", 6)]);
    let (x, z) = (ids[0], ids[1]);

    commit(&core, planes(x, 2)).await;
    commit(&core, planes(z, 2)).await;
    assert_eq!(core.output_state(x).unwrap().reserved.bits(), 0b0000_0011);
    assert_eq!(core.pool().available().bits(), 0b1111_0000);

    commit(&core, planes(x, 4)).await;

    let reserved = core.output_state(x).unwrap().reserved;
    assert_eq!(reserved.bits(), 0b0011_0011);
    assert_eq!(reserved.count(), 4);
    assert_eq!(core.pool().available().count(), 2);
    assert_conserved(&core);
}

#[tokio::test]
async fn test_simultaneous_growth_with_one_window_left() {
    let (core, _hw, ids) = setup(config(3), &[("X", 3), ("Y", 3)]);
    let (x, y) = (ids[0], ids[1]);
    commit(&core, planes(x, 1)).await;
    commit(&core, planes(y, 1)).await;
    assert_eq!(core.pool().available().count(), 1);

    let (rx, ry) = tokio::join!(
        core.validate(Transaction::new().with(planes(x, 2))),
        core.validate(Transaction::new().with(planes(y, 2))),
    );

    let results = [rx, ry];
    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert!(matches!(loser, ValidationError::ResourceExhausted { requested: 1, .. }));
    assert!(loser.is_retryable());
}

#[tokio::test]
async fn test_freed_windows_stay_out_of_pool_until_retired() {
    let (core, hw, ids) = setup(config(4), &[("X", 4), ("Y", 4)]);
    let (x, y) = (ids[0], ids[1]);
    commit(&core, planes(x, 3)).await;
    assert_eq!(core.pool().available().bits(), 0b1000);

    hw.hold_completion(x);
    let shrink = core
        .submit(Transaction::new().with(planes(x, 1)), CommitMode::NonBlocking)
        .await
        .unwrap();

    let state = core.output_state(x).unwrap();
    assert_eq!(state.freed_pending.bits(), 0b0011);
    assert_eq!(state.reserved.bits(), 0b0100);
    assert!(core.pool().available().is_disjoint(state.freed_pending));
    assert_conserved(&core);

    // Growth on Y sees only the one free window, waits out the retry, fails.
    let err = core
        .validate(Transaction::new().with(planes(y, 2)))
        .await
        .unwrap_err();
    assert!(matches!(err, ValidationError::ResourceExhausted { output, .. } if output == y));
    assert_eq!(core.pool().available().bits(), 0b1000);

    hw.release_completion(x);
    shrink.wait().await.unwrap();

    assert!(core.output_state(x).unwrap().freed_pending.is_empty());
    assert_eq!(core.pool().available().bits(), 0b1011);
    assert!(!core.is_pending(x));
    assert_conserved(&core);
}

#[tokio::test]
async fn test_abandoned_blocking_commit_still_retires() {
    let (core, hw, ids) = setup(config(4), &[("X", 4)]);
    let x = ids[0];
    commit(&core, planes(x, 3)).await;

    hw.hold_completion(x);
    let abandoned = tokio::time::timeout(
        Duration::from_millis(20),
        core.submit(Transaction::new().with(planes(x, 1)), CommitMode::Blocking),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(core.output_state(x).unwrap().freed_pending.bits(), 0b0011);

    hw.release_completion(x);
    tokio::time::timeout(Duration::from_secs(1), core.wait_idle(x))
        .await
        .unwrap();

    assert!(!core.is_pending(x));
    assert!(core.output_state(x).unwrap().freed_pending.is_empty());
    assert_eq!(core.pool().available().bits(), 0b1011);
    assert_conserved(&core);

    // The output accepts new work
    commit(&core, planes(x, 2)).await;
    assert_conserved(&core);
}

#[tokio::test]
async fn test_growth_retry_picks_up_release_in_flight() {
    let mut cfg = config(4);
    cfg.timing.retry_wait_ms = 2_000;
    let (core, hw, ids) = setup(cfg, &[("X", 4), ("Y", 4)]);
    let (x, y) = (ids[0], ids[1]);
    commit(&core, planes(x, 4)).await;

    hw.hold_completion(x);
    let shrink = core
        .submit(Transaction::new().with(planes(x, 1)), CommitMode::NonBlocking)
        .await
        .unwrap();

    let releaser = {
        let hw = hw.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            hw.release_completion(x);
        })
    };

    let prepared = core
        .validate(Transaction::new().with(planes(y, 2)))
        .await
        .unwrap();
    assert_eq!(prepared.new_state(y).unwrap().reserved.bits(), 0b0011);

    core.commit(prepared, CommitMode::Blocking).await.unwrap().wait().await.unwrap();
    shrink.wait().await.unwrap();
    releaser.await.unwrap();
    assert_conserved(&core);
}

#[tokio::test]
async fn test_growth_retry_waits_past_earlier_release() {
    let mut cfg = config(5);
    cfg.timing.retry_wait_ms = 2_000;
    let (core, hw, ids) = setup(cfg, &[("X", 4), ("Y", 4), ("Z", 1)]);
    let (x, y, z) = (ids[0], ids[1], ids[2]);
    commit(&core, planes(x, 4)).await;
    commit(&core, planes(z, 1)).await;
    assert!(core.pool().available().is_empty());

    hw.hold_completion(x);
    let shrink = core
        .submit(Transaction::new().with(planes(x, 1)), CommitMode::NonBlocking)
        .await
        .unwrap();

    // One window comes back right before the growth; not enough on its own.
    commit(&core, OutputUpdate::disable(z)).await;
    assert_eq!(core.pool().available().count(), 1);

    let releaser = {
        let hw = hw.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            hw.release_completion(x);
        })
    };

    let prepared = core
        .validate(Transaction::new().with(planes(y, 2)))
        .await
        .unwrap();
    assert_eq!(prepared.new_state(y).unwrap().reserved.bits(), 0b0_0011);

    core.commit(prepared, CommitMode::Blocking).await.unwrap().wait().await.unwrap();
    shrink.wait().await.unwrap();
    releaser.await.unwrap();
    assert_conserved(&core);
}

#[tokio::test]
async fn test_second_transaction_while_running_is_rejected() {
    let (core, hw, ids) = setup(config(4), &[("X", 4)]);
    let x = ids[0];
    commit(&core, planes(x, 1)).await;

    hw.hold_completion(x);
    let running = core
        .submit(Transaction::new().with(planes(x, 2)), CommitMode::NonBlocking)
        .await
        .unwrap();
    assert!(core.is_pending(x));

    let before_state = core.output_state(x).unwrap();
    let before_pool = core.pool().available();

    let err = core
        .submit(Transaction::new().with(planes(x, 3)), CommitMode::NonBlocking)
        .await
        .unwrap_err();
    assert_eq!(err, CommitError::Validation(ValidationError::AlreadyPending(x)));
    assert_eq!(core.output_state(x).unwrap(), before_state);
    assert_eq!(core.pool().available(), before_pool);

    hw.release_completion(x);
    running.wait().await.unwrap();
    core.wait_idle(x).await;
    assert!(!core.is_pending(x));
}

#[tokio::test]
async fn test_stuck_fence_times_out_and_still_releases() {
    let mut cfg = config(4);
    cfg.timing.fence_timeout_ms = 40;
    let (core, hw, ids) = setup(cfg, &[("X", 4)]);
    let x = ids[0];
    commit(&core, planes(x, 3)).await;

    let stuck = Fence::new();
    let txn = Transaction::new()
        .with(OutputUpdate::enable(x).plane(PlaneState::new(0, 0).fence(stuck.clone())));
    let ticket = core.submit(txn, CommitMode::NonBlocking).await.unwrap();

    let err = ticket.wait().await.unwrap_err();
    assert!(matches!(err, CommitError::Fence(FenceError::Timeout { .. })));
    assert!(err.to_string().contains("not signalled"));

    let state = core.output_state(x).unwrap();
    assert!(state.freed_pending.is_empty());
    assert_eq!(state.reserved.count(), 1);
    assert_eq!(core.pool().available().count(), 3);
    // Nothing reached the hardware for the timed-out frame.
    assert_eq!(hw.program_count(x), 1);
    assert!(!core.is_pending(x));
    assert_eq!(stuck.ref_count(), 1);
}

#[tokio::test]
async fn test_blocking_commit_with_stuck_fence_rolls_back() {
    let mut cfg = config(4);
    cfg.timing.fence_timeout_ms = 40;
    let (core, _hw, ids) = setup(cfg, &[("X", 4)]);
    let x = ids[0];
    commit(&core, planes(x, 1)).await;
    let before = core.snapshot();

    let txn = Transaction::new().with(
        planes(x, 3).plane(PlaneState::new(50, 9).fence(Fence::new())),
    );
    let err = core.submit(txn, CommitMode::Blocking).await.unwrap_err();
    assert!(matches!(err, CommitError::Fence(FenceError::Timeout { .. })));

    assert_eq!(core.snapshot(), before);
    assert!(!core.is_pending(x));
}

#[tokio::test]
async fn test_late_fence_commits() {
    let (core, hw, ids) = setup(config(4), &[("X", 4)]);
    let x = ids[0];

    let fence = Fence::new();
    let producer = {
        let fence = fence.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            fence.signal();
        })
    };

    let txn = Transaction::new().with(OutputUpdate::enable(x).plane(PlaneState::new(1, 0).fence(fence)));
    core.submit(txn, CommitMode::NonBlocking).await.unwrap().wait().await.unwrap();
    producer.await.unwrap();

    assert_eq!(hw.program_count(x), 1);
    assert_eq!(core.output_state(x).unwrap().visible.count(), 1);
}

#[tokio::test]
async fn test_failed_producer_fence_aborts_frame() {
    let (core, hw, ids) = setup(config(4), &[("X", 4)]);
    let x = ids[0];

    let fence = Fence::new();
    fence.signal_error("gpu reset");
    let txn = Transaction::new().with(OutputUpdate::enable(x).plane(PlaneState::new(1, 0).fence(fence)));
    let err = core
        .submit(txn, CommitMode::NonBlocking)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap_err();

    assert!(matches!(err, CommitError::Fence(FenceError::Failed { .. })));
    assert_eq!(hw.program_count(x), 0);
    assert!(!core.is_pending(x));
    assert_conserved(&core);
}

#[tokio::test]
async fn test_multi_output_failure_leaves_everything_unchanged() {
    let (core, _hw, ids) = setup(config(4), &[("X", 4), ("Y", 4)]);
    let (x, y) = (ids[0], ids[1]);
    commit(&core, planes(x, 2)).await;
    commit(&core, planes(y, 1)).await;
    let before = core.snapshot();

    // X shrinks (no pool access), Y wants more than is free.
    let txn = Transaction::new().with(planes(x, 1)).with(planes(y, 4));
    let err = core.validate(txn).await.unwrap_err();
    assert!(matches!(err, ValidationError::ResourceExhausted { output, .. } if output == y));

    assert_eq!(core.snapshot(), before);
    assert!(!core.is_pending(x));
    assert!(!core.is_pending(y));
}

#[tokio::test]
async fn test_freed_windows_return_after_hardware_failure() {
    let (core, hw, ids) = setup(config(4), &[("X", 4)]);
    let x = ids[0];
    commit(&core, planes(x, 3)).await;

    hw.fail_next_program(x, "underrun");
    let done = Fence::new();
    let txn = Transaction::new().with(planes(x, 1).out_fence(done.clone()));
    let err = core
        .submit(txn, CommitMode::NonBlocking)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap_err();

    assert!(matches!(err, CommitError::Hardware(HwError::Program { .. })));
    assert_eq!(core.pool().available().count(), 3);
    assert!(core.output_state(x).unwrap().freed_pending.is_empty());
    assert!(matches!(done.status(), Some(Err(FenceError::Failed { .. }))));
    assert_conserved(&core);
}

#[tokio::test]
async fn test_freed_windows_return_after_deadlock() {
    let (core, hw, ids) = setup(config(4), &[("X", 4)]);
    let x = ids[0];
    commit(&core, planes(x, 2)).await;

    hw.set_completion(x, Completion::DeadlockError);
    let err = core
        .submit(Transaction::new().with(planes(x, 1)), CommitMode::Blocking)
        .await
        .unwrap_err();

    assert_eq!(err, CommitError::Hardware(HwError::Deadlock(x)));
    assert_eq!(core.pool().available().count(), 3);
    assert_conserved(&core);
}

#[tokio::test]
async fn test_completion_timeout_still_retires() {
    let mut cfg = config(4);
    cfg.timing.frame_done_timeout_ms = 20;
    let (core, hw, ids) = setup(cfg, &[("X", 4)]);
    let x = ids[0];
    commit(&core, planes(x, 2)).await;

    hw.hold_completion(x);
    let err = core
        .submit(Transaction::new().with(planes(x, 1)), CommitMode::NonBlocking)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap_err();

    assert!(matches!(err, CommitError::Hardware(HwError::CompletionTimeout { output, .. }) if output == x));
    assert_eq!(core.pool().available().count(), 3);
    assert!(!core.is_pending(x));
}

#[tokio::test]
async fn test_switch_off_completes_instantly() {
    let (core, hw, ids) = setup(config(4), &[("X", 4)]);
    let x = ids[0];
    commit(&core, planes(x, 3)).await;

    let done = Fence::new();
    core.submit(
        Transaction::new().with(OutputUpdate::disable(x).out_fence(done.clone())),
        CommitMode::NonBlocking,
    )
    .await
    .unwrap()
    .wait()
    .await
    .unwrap();

    assert_eq!(done.status(), Some(Ok(())));
    assert_eq!(core.pool().available(), WindowMask::full(4));
    let state = core.output_state(x).unwrap();
    assert!(!state.active);
    assert!(state.reserved.is_empty());
    assert!(!hw.last_frame(x).unwrap().active);
}

#[tokio::test]
async fn test_multi_output_commit_programs_every_output() {
    let (core, hw, ids) = setup(config(8), &[("X", 4), ("Y", 4)]);
    let (x, y) = (ids[0], ids[1]);

    let txn = Transaction::new().with(planes(y, 2)).with(planes(x, 3));
    let ticket = core.submit(txn, CommitMode::NonBlocking).await.unwrap();
    assert!(!ticket.is_done());
    ticket.wait().await.unwrap();

    assert_eq!(hw.program_count(x), 1);
    assert_eq!(hw.program_count(y), 1);
    // Registration order: X is allocated first.
    assert_eq!(core.output_state(x).unwrap().reserved.bits(), 0b0000_0111);
    assert_eq!(core.output_state(y).unwrap().reserved.bits(), 0b0001_1000);
    assert!(!core.is_pending(x) && !core.is_pending(y));
}

#[tokio::test]
async fn test_cancel_before_commit_rolls_back() {
    let (core, _hw, ids) = setup(config(4), &[("X", 4)]);
    let x = ids[0];

    let txn = Transaction::new().with(planes(x, 2));
    let handle = txn.cancel_handle();
    let prepared = core.validate(txn).await.unwrap();
    assert_eq!(core.pool().available().count(), 2);

    handle.cancel();
    let err = core.commit(prepared, CommitMode::NonBlocking).await.unwrap_err();
    assert_eq!(err, CommitError::Cancelled);
    assert_eq!(core.pool().available().count(), 4);
    assert!(!core.is_pending(x));
}

#[tokio::test]
async fn test_cancel_interrupts_pre_swap_fence_wait() {
    let (core, _hw, ids) = setup(config(4), &[("X", 4)]);
    let x = ids[0];

    let txn = Transaction::new()
        .with(OutputUpdate::enable(x).plane(PlaneState::new(1, 0).fence(Fence::new())));
    let handle = txn.cancel_handle();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(15)).await;
        handle.cancel();
    });

    let err = core.submit(txn, CommitMode::Blocking).await.unwrap_err();
    canceller.await.unwrap();

    assert_eq!(err, CommitError::Cancelled);
    assert_eq!(core.pool().available(), WindowMask::full(4));
    assert_eq!(core.output_state(x).unwrap().reserved, WindowMask::EMPTY);
    assert!(!core.is_pending(x));
}
