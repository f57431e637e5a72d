mod common;

use common::*;
use dsp_stream_rs::{Dispatch, EngineState, StreamId, WakeOutcome};

#[tokio::test(start_paused = true)]
async fn hotword_trigger_streams_backlog_then_waits_for_producer() {
    let mut rig = Rig::new();
    rig.attach(StreamId::Hotword);
    rig.sim.write_mem(BASE, &pattern(0x10000, 7));
    rig.map(StreamId::Hotword, BASE, LIMIT, BASE + 0x8000);
    rig.raise(StreamId::Hotword);

    let outcome = rig.device.handle_wake().await;
    assert_eq!(
        outcome,
        WakeOutcome::Dispatched(Dispatch::Started(StreamId::Hotword))
    );
    assert_eq!(rig.sim.reg(rig.layout.hotword_flag), 0);
    assert_eq!(rig.device.engine_state(StreamId::Hotword), EngineState::Polling);

    settle(1000).await;
    let periods = rig.drain();
    // The whole ring is backlog; afterwards the producer has to move.
    assert_eq!(periods.len(), 16);
    assert_eq!(&periods[0].data[..], &rig.sim.read_mem(BASE + 0x8000, PERIOD)[..]);
    assert_eq!(&periods[8].data[..], &rig.sim.read_mem(BASE, PERIOD)[..]);
    let offsets: Vec<_> = periods.iter().take(5).map(|p| p.offset).collect();
    assert_eq!(offsets, vec![0, 4096, 8192, 12288, 0]);

    rig.sim.produce(rig.layout.voice, &pattern(PERIOD, 3));
    settle(100).await;
    let periods = rig.drain();
    assert_eq!(periods.len(), 1);
    assert_eq!(&periods[0].data[..], &pattern(PERIOD, 3)[..]);
    assert_eq!(rig.device.ring(StreamId::Hotword).unwrap().read_ptr, BASE + 0x9000);
}

#[tokio::test(start_paused = true)]
async fn straddling_period_is_read_in_two_parts() {
    let mut rig = Rig::new();
    rig.attach(StreamId::Hotword);
    rig.sim.write_mem(BASE, &pattern(0x10000, 1));
    rig.map(StreamId::Hotword, BASE, LIMIT, 0x4fe0_fff0);
    rig.raise(StreamId::Hotword);

    rig.device.handle_wake().await;
    settle(1).await;

    let periods = rig.drain();
    assert_eq!(periods.len(), 1);
    let mut expected = rig.sim.read_mem(0x4fe0_fff0, 16);
    expected.extend(rig.sim.read_mem(BASE, 4080));
    assert_eq!(&periods[0].data[..], &expected[..]);

    let reads = rig.sim.burst_reads();
    assert_eq!(reads[0], (0x4fe0_fff0, 16));
    assert_eq!(reads[1].0, BASE);
    assert_eq!(reads.iter().map(|r| r.1).sum::<usize>(), PERIOD);
    assert_eq!(rig.device.ring(StreamId::Hotword).unwrap().read_ptr, 0x4fe0_0ff0);
}

#[tokio::test(start_paused = true)]
async fn invalid_geometry_gives_up_after_bounded_retries() {
    let rig = Rig::new();
    rig.attach(StreamId::Hotword);
    rig.map(StreamId::Hotword, 0x0000_1234, LIMIT, BASE);
    rig.raise(StreamId::Hotword);

    let outcome = rig.device.handle_wake().await;
    assert_eq!(
        outcome,
        WakeOutcome::Dispatched(Dispatch::NotReady(StreamId::Hotword))
    );
    assert_eq!(rig.sim.reg_reads(rig.layout.voice.base), 3);
    assert_eq!(rig.sim.reg_reads(rig.layout.voice.limit), 0);
    assert!(rig.device.ring(StreamId::Hotword).is_none());
    assert_eq!(rig.device.engine_state(StreamId::Hotword), EngineState::Armed);
    assert!(!rig.device.copy_pending(StreamId::Hotword));
}

#[tokio::test(start_paused = true)]
async fn trigger_without_binding_is_refused() {
    let rig = Rig::new();
    rig.map(StreamId::Hotword, BASE, LIMIT, BASE);
    rig.raise(StreamId::Hotword);

    let outcome = rig.device.handle_wake().await;
    assert_eq!(
        outcome,
        WakeOutcome::Dispatched(Dispatch::Refused(StreamId::Hotword))
    );
    assert_eq!(rig.sim.reg(rig.layout.hotword_flag), 0);
    assert_eq!(rig.sim.reg_reads(rig.layout.voice.base), 0);
    assert_eq!(rig.device.engine_state(StreamId::Hotword), EngineState::Idle);
}

#[tokio::test(start_paused = true)]
async fn second_trigger_while_streaming_is_refused() {
    let rig = Rig::new();
    rig.attach(StreamId::Hotword);
    rig.map(StreamId::Hotword, BASE, LIMIT, BASE);
    rig.raise(StreamId::Hotword);
    rig.device.handle_wake().await;
    settle(25).await;
    let before = rig.device.ring(StreamId::Hotword).unwrap();

    rig.raise(StreamId::Hotword);
    let outcome = rig.device.handle_wake().await;
    assert_eq!(
        outcome,
        WakeOutcome::Dispatched(Dispatch::Refused(StreamId::Hotword))
    );
    let after = rig.device.ring(StreamId::Hotword).unwrap();
    assert_eq!(after.base, before.base);
    assert_eq!(after.consumed, before.consumed);
}

#[tokio::test(start_paused = true)]
async fn no_flag_means_no_trigger() {
    let rig = Rig::new();
    rig.attach(StreamId::Hotword);
    let outcome = rig.device.handle_wake().await;
    assert_eq!(outcome, WakeOutcome::Dispatched(Dispatch::NoTrigger));
    assert_eq!(rig.device.engine_state(StreamId::Hotword), EngineState::Armed);
}

#[tokio::test(start_paused = true)]
async fn musdet_trigger_applies_its_skip_window() {
    let mut config = config();
    config.capture.musdet_skip.ignore_ms = 100;
    config.capture.musdet_skip.bytes_per_ms = 16;
    let rig = Rig::with(config, None);
    rig.attach(StreamId::Musdet);
    rig.map(StreamId::Musdet, BASE, LIMIT, BASE + 0x1000);
    rig.raise(StreamId::Musdet);

    let outcome = rig.device.handle_wake().await;
    assert_eq!(
        outcome,
        WakeOutcome::Dispatched(Dispatch::Started(StreamId::Musdet))
    );
    assert_eq!(rig.sim.reg(rig.layout.musdet_flag), 0);

    let ring = rig.device.ring(StreamId::Musdet).unwrap();
    assert_eq!(ring.read_ptr, BASE + 0x1000 + 1600);
    assert_eq!(ring.size, 0x10000 - 1600);
    assert_eq!(rig.device.engine_state(StreamId::Hotword), EngineState::Idle);
}

#[tokio::test(start_paused = true)]
async fn detach_mid_fallback_cancels_and_reattach_is_clean() {
    let mut rig = Rig::new();
    rig.attach(StreamId::Hotword);
    rig.map(StreamId::Hotword, BASE, LIMIT, BASE);
    rig.raise(StreamId::Hotword);
    rig.device.handle_wake().await;

    // Drain the backlog; the engine is now waiting on the producer.
    settle(1000).await;
    assert_eq!(rig.drain().len(), 16);
    assert!(rig.device.copy_pending(StreamId::Hotword));

    rig.device.detach(StreamId::Hotword).await;
    assert!(!rig.device.copy_pending(StreamId::Hotword));
    assert_eq!(rig.device.engine_state(StreamId::Hotword), EngineState::Idle);
    assert!(rig.device.ring(StreamId::Hotword).is_none());

    rig.sim.clear_log();
    settle(500).await;
    assert_eq!(rig.sim.reg_reads(rig.layout.voice.write_ptr), 0);
    assert!(rig.sim.burst_reads().is_empty());

    rig.attach(StreamId::Hotword);
    assert_eq!(rig.device.engine_state(StreamId::Hotword), EngineState::Armed);
    assert_eq!(rig.device.host_pointer(StreamId::Hotword), Some(0));
    assert!(rig.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_burst_delivers_nothing_and_retries_at_fallback() {
    let mut rig = Rig::new();
    rig.attach(StreamId::Hotword);
    rig.sim.write_mem(BASE, &pattern(PERIOD, 9));
    rig.map(StreamId::Hotword, BASE, LIMIT, BASE);
    rig.raise(StreamId::Hotword);
    rig.device.handle_wake().await;
    rig.sim.fail_next(1);

    settle(1).await;
    assert!(rig.drain().is_empty());
    let ring = rig.device.ring(StreamId::Hotword).unwrap();
    assert_eq!(ring.read_ptr, BASE);
    assert_eq!(ring.consumed, 0);

    settle(30).await;
    assert!(rig.drain().is_empty());

    settle(25).await;
    let periods = rig.drain();
    assert_eq!(periods.len(), 1);
    assert_eq!(periods[0].offset, 0);
    assert_eq!(&periods[0].data[..], &pattern(PERIOD, 9)[..]);
}

#[tokio::test(start_paused = true)]
async fn zero_period_holds_off_without_bus_traffic() {
    let mut rig = Rig::new();
    rig.device
        .attach(StreamId::Hotword, HOST_BUFFER, rig.listener.clone())
        .unwrap();
    rig.map(StreamId::Hotword, BASE, LIMIT, BASE);
    rig.raise(StreamId::Hotword);
    rig.device.handle_wake().await;
    rig.sim.clear_log();

    settle(200).await;
    assert!(rig.sim.burst_reads().is_empty());
    assert!(rig.drain().is_empty());

    rig.device.set_period_bytes(StreamId::Hotword, PERIOD).unwrap();
    settle(60).await;
    assert!(!rig.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn raw_capture_arms_on_attach_without_flags() {
    let mut rig = Rig::new();
    rig.map(StreamId::RawAdc, 0, 0, 0);
    rig.attach(StreamId::RawAdc);

    settle(200).await;
    assert!(rig.device.ring(StreamId::RawAdc).is_none());
    assert!(rig.sim.reg_reads(rig.layout.adc.base) > 1);

    rig.map(StreamId::RawAdc, BASE, LIMIT, BASE + 0x4000);
    settle(100).await;
    let ring = rig.device.ring(StreamId::RawAdc).unwrap();
    assert_eq!(ring.size, 0x10000);
    assert!(!rig.drain().is_empty());

    let flags = [rig.layout.hotword_flag, rig.layout.musdet_flag];
    assert!(rig.sim.reg_writes().iter().all(|(a, _)| !flags.contains(a)));
}

#[tokio::test(start_paused = true)]
async fn binding_misuse_is_rejected() {
    let rig = Rig::new();
    assert!(rig.device.set_period_bytes(StreamId::Hotword, PERIOD).is_err());
    assert!(
        rig.device
            .attach(StreamId::Hotword, 0, rig.listener.clone())
            .is_err()
    );
    rig.attach(StreamId::Hotword);
    assert!(
        rig.device
            .attach(StreamId::Hotword, HOST_BUFFER, rig.listener.clone())
            .is_err()
    );
    assert!(rig.device.set_period_bytes(StreamId::Hotword, 12).is_err());
    assert!(
        rig.device
            .set_period_bytes(StreamId::Hotword, HOST_BUFFER * 2)
            .is_err()
    );
}

#[tokio::test(start_paused = true)]
async fn transient_flag_read_failure_is_retried() {
    let mut rig = Rig::new();
    rig.attach(StreamId::Hotword);
    rig.map(StreamId::Hotword, BASE, LIMIT, BASE);
    rig.raise(StreamId::Hotword);
    // The watchdog status read, then the hotword flag read.
    rig.sim.fail_next(2);

    let outcome = rig.device.handle_wake().await;
    assert_eq!(
        outcome,
        WakeOutcome::Dispatched(Dispatch::Started(StreamId::Hotword))
    );
    assert_eq!(rig.sim.reg(rig.layout.hotword_flag), 0);
    assert_eq!(rig.device.engine_state(StreamId::Hotword), EngineState::Polling);
    settle(25).await;
    assert!(!rig.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn dispatcher_wakes_again_after_flag_access_gives_up() {
    let rig = Rig::new();
    let dispatcher = rig.device.spawn_dispatcher();
    rig.attach(StreamId::Hotword);
    rig.map(StreamId::Hotword, BASE, LIMIT, BASE);
    rig.raise(StreamId::Hotword);
    // Status read plus every flag attempt.
    rig.sim.fail_next(4);

    rig.device.wake();
    settle(20).await;
    assert_eq!(rig.sim.reg(rig.layout.hotword_flag), 1);
    assert_eq!(rig.device.engine_state(StreamId::Hotword), EngineState::Armed);

    settle(100).await;
    assert_eq!(rig.sim.reg(rig.layout.hotword_flag), 0);
    assert_eq!(rig.device.engine_state(StreamId::Hotword), EngineState::Polling);
    dispatcher.abort();
}
