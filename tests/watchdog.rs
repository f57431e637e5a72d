mod common;

use std::io;
use std::sync::{Arc, Mutex};

use common::*;
use dsp_stream_rs::{
    Dispatch, DspError, DspMode, EngineState, HealthState, ResetLine, StreamId, WakeOutcome,
};

#[derive(Clone, Default)]
struct RecordingLine(Arc<Mutex<Vec<bool>>>);

impl ResetLine for RecordingLine {
    fn set_level(&self, high: bool) -> io::Result<()> {
        self.0.lock().unwrap().push(high);
        Ok(())
    }
}

async fn streaming_hotword(rig: &Rig) {
    rig.device.start(StreamId::Hotword).await.unwrap();
    rig.attach(StreamId::Hotword);
    rig.map(StreamId::Hotword, BASE, LIMIT, BASE);
    rig.raise(StreamId::Hotword);
    assert_eq!(
        rig.device.handle_wake().await,
        WakeOutcome::Dispatched(Dispatch::Started(StreamId::Hotword))
    );
    settle(25).await;
}

#[tokio::test(start_paused = true)]
async fn fault_while_hotword_active_reissues_voice_trigger() {
    let mut rig = Rig::new();
    streaming_hotword(&rig).await;
    assert!(!rig.drain().is_empty());

    rig.sim.set_reg(rig.layout.watchdog_status, 0xdead);
    // A pending trigger must not be dispatched on the recovery wake.
    rig.raise(StreamId::Hotword);
    rig.sim.clear_log();

    assert_eq!(rig.device.handle_wake().await, WakeOutcome::Recovered);
    assert_eq!(rig.device.health(), HealthState::Running);
    assert_eq!(rig.sim.reg(rig.layout.watchdog_status), 0);
    assert_eq!(rig.sim.reg(rig.layout.hotword_flag), 1);

    let writes = rig.sim.reg_writes();
    assert_eq!(writes[0], (0xfafa_fafa, 1));
    let run = writes
        .iter()
        .position(|w| *w == (rig.layout.dsp_run, rig.layout.dsp_run_value))
        .unwrap();
    assert_eq!(
        &writes[run + 1..run + 4],
        &[
            (rig.layout.wov_type, 1),
            (rig.layout.dsp_func, 0),
            (rig.layout.dsp_cmd, 1),
        ]
    );
    assert_eq!(rig.device.last_mode(), Some(DspMode::VoiceTrigger));
    assert!(rig.device.take_register_cache_dirty());
    assert!(!rig.device.take_register_cache_dirty());

    // Pointers are gone but the host binding survived.
    assert!(rig.device.ring(StreamId::Hotword).is_none());
    assert_eq!(rig.device.engine_state(StreamId::Hotword), EngineState::Armed);

    // The next trigger restarts capture without re-attaching.
    rig.drain();
    assert_eq!(
        rig.device.handle_wake().await,
        WakeOutcome::Dispatched(Dispatch::Started(StreamId::Hotword))
    );
    settle(25).await;
    assert!(!rig.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reset_line_is_pulsed_instead_of_patching() {
    let line = RecordingLine::default();
    let rig = Rig::with(config(), Some(Box::new(line.clone())));
    rig.device.start(StreamId::Hotword).await.unwrap();
    rig.sim.set_reg(rig.layout.watchdog_status, 1);
    rig.sim.clear_log();

    assert_eq!(rig.device.handle_wake().await, WakeOutcome::Recovered);
    assert_eq!(*line.0.lock().unwrap(), vec![false, true]);
    assert!(!rig.sim.reg_writes().contains(&(0xfafa_fafa, 1)));
    assert_eq!(rig.sim.resets(), 1);
}

#[tokio::test(start_paused = true)]
async fn hung_status_reads_count_as_a_fault() {
    let rig = Rig::new();
    for _ in 0..2 {
        rig.sim.fail_next(1);
        assert_eq!(
            rig.device.handle_wake().await,
            WakeOutcome::Dispatched(Dispatch::NoTrigger)
        );
    }
    assert_eq!(rig.sim.resets(), 0);

    rig.sim.fail_next(1);
    assert_eq!(rig.device.handle_wake().await, WakeOutcome::Recovered);
    assert_eq!(rig.sim.resets(), 1);
    // No mode was requested, so the DSP is parked.
    assert_eq!(rig.sim.reg(rig.layout.dsp_func), DspMode::Suspend.func());
}

#[tokio::test(start_paused = true)]
async fn successful_status_read_resets_the_failure_count() {
    let rig = Rig::new();
    for _ in 0..2 {
        rig.sim.fail_next(1);
        rig.device.handle_wake().await;
    }
    rig.device.handle_wake().await;
    rig.sim.fail_next(1);
    assert_eq!(
        rig.device.handle_wake().await,
        WakeOutcome::Dispatched(Dispatch::NoTrigger)
    );
    assert_eq!(rig.sim.resets(), 0);
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_mode_retries_reset_once() {
    let rig = Rig::new();
    rig.device.start(StreamId::Musdet).await.unwrap();
    rig.sim.hang_commands(true);

    let err = rig.device.reset_and_restart_active_stream().await.unwrap_err();
    assert!(matches!(err, DspError::DeviceFault(1)));
    assert_eq!(rig.sim.resets(), 2);
    assert_eq!(rig.device.health(), HealthState::Running);
    assert_eq!(rig.device.last_mode(), Some(DspMode::SecondaryDetector));
}

#[tokio::test(start_paused = true)]
async fn raw_capture_rearms_after_reset() {
    let mut rig = Rig::new();
    rig.device.start(StreamId::RawAdc).await.unwrap();
    rig.map(StreamId::RawAdc, BASE, LIMIT, BASE);
    rig.attach(StreamId::RawAdc);
    settle(50).await;
    assert!(rig.device.ring(StreamId::RawAdc).is_some());

    rig.device.reset_and_restart_active_stream().await.unwrap();
    assert_eq!(rig.device.last_mode(), Some(DspMode::RawPassthrough));
    assert_eq!(rig.sim.reg(rig.layout.dsp_func), DspMode::RawPassthrough.func());

    rig.drain();
    settle(100).await;
    assert!(rig.device.ring(StreamId::RawAdc).is_some());
    assert!(!rig.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_suspends_the_mode_it_owned() {
    let rig = Rig::new();
    streaming_hotword(&rig).await;
    rig.sim.clear_log();

    rig.device.stop(StreamId::Hotword).await;
    assert!(!rig.device.copy_pending(StreamId::Hotword));
    assert!(rig.device.ring(StreamId::Hotword).is_none());
    assert_eq!(rig.device.last_mode(), None);
    assert!(
        rig.sim
            .reg_writes()
            .contains(&(rig.layout.dsp_func, DspMode::Suspend.func()))
    );

    // Stopping a stream that never owned the mode leaves the DSP alone.
    rig.device.start(StreamId::Hotword).await.unwrap();
    rig.sim.clear_log();
    rig.device.stop(StreamId::Musdet).await;
    assert_eq!(rig.device.last_mode(), Some(DspMode::VoiceTrigger));
    assert!(rig.sim.reg_writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn copy_engine_holds_off_while_reset_is_in_progress() {
    let mut rig = Rig::new();
    rig.sim.write_mem(BASE, &pattern(PERIOD, 4));
    rig.map(StreamId::RawAdc, BASE, LIMIT, BASE);
    rig.sim.hang_commands(true);

    let device = rig.device.clone();
    let reset = tokio::spawn(async move { device.reset_and_restart_active_stream().await });
    settle(20).await;
    assert_eq!(rig.device.health(), HealthState::ResetInProgress);

    rig.sim.clear_log();
    rig.attach(StreamId::RawAdc);
    assert!(rig.device.copy_pending(StreamId::RawAdc));
    settle(60).await;
    assert_eq!(rig.device.health(), HealthState::ResetInProgress);
    assert!(rig.sim.burst_reads().is_empty());
    assert_eq!(rig.sim.reg_reads(rig.layout.adc.base), 0);
    assert!(rig.drain().is_empty());

    // The first attempt times out; the second one is acknowledged.
    rig.sim.hang_commands(false);
    reset.await.unwrap().unwrap();
    assert_eq!(rig.device.health(), HealthState::Running);
    assert_eq!(rig.sim.resets(), 2);

    settle(100).await;
    assert!(rig.device.ring(StreamId::RawAdc).is_some());
    assert!(!rig.drain().is_empty());
}
