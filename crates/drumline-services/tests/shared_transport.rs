//! Regression tests: synchronization with a shared transport.

use approx::assert_abs_diff_eq;
use drumline_core::{ClockRole, LEADER_TRACKING_CYCLES, Preferences, Song};
use drumline_services::{AudioEngine, EngineEvent, OfflineDriver, SimulatedTransport, TempoSource};

const SAMPLE_RATE: u32 = 48000;
const BUFFER: u32 = 480;

fn engine() -> AudioEngine {
    let prefs = Preferences {
        sample_rate: SAMPLE_RATE,
        buffer_size: BUFFER,
        external_transport: true,
        ..Default::default()
    };
    AudioEngine::new(Song::demo(), prefs)
}

fn roles(engine: &AudioEngine) -> Vec<ClockRole> {
    engine
        .events()
        .try_iter()
        .filter_map(|e| match e {
            EngineEvent::RoleChanged(role) => Some(role),
            _ => None,
        })
        .collect()
}

#[test]
fn leader_loss_after_missed_requests() {
    let engine = engine();
    let controller = engine.controller();
    controller.add_tempo_marker(0, 140.0);
    controller.activate_timeline(true);

    let shared = SimulatedTransport::new(SAMPLE_RATE);
    assert!(engine.enable_external_transport(Box::new(shared.client()), true));
    let mut driver = OfflineDriver::new(&engine, BUFFER, 2).with_shared_transport(shared.clone());
    controller.start();

    let report = driver.run(3);
    assert_eq!(report.role, ClockRole::Leader);
    assert_eq!(report.final_bpm, 140.0);
    assert_eq!(shared.leader_bbt().map(|b| b.bpm), Some(140.0));

    shared.install_foreign_leader(100.0);
    let report = driver.run(LEADER_TRACKING_CYCLES as usize - 1);
    assert_eq!(report.role, ClockRole::Leader);

    let report = driver.run(1);
    assert_eq!(report.role, ClockRole::None);
    // Tempo comes from the timeline again
    assert_eq!(engine.tempo_source(), TempoSource::Timeline);
    assert_eq!(report.final_bpm, 140.0);
    assert!(engine.is_playing());

    // The new leader is followed from the next cycle on
    let report = driver.run(1);
    assert_eq!(report.role, ClockRole::Follower);
    assert_eq!(report.final_bpm, 100.0);
    assert_eq!(
        roles(&engine),
        vec![ClockRole::Leader, ClockRole::None, ClockRole::Follower]
    );
}

#[test]
fn follower_adopts_leader_tempo_and_position() {
    let engine = engine();
    let shared = SimulatedTransport::new(SAMPLE_RATE);
    shared.install_foreign_leader(100.0);
    shared.locate(57_600);
    shared.set_rolling(true);
    assert!(!engine.enable_external_transport(Box::new(shared.client()), false));
    let mut driver = OfflineDriver::new(&engine, BUFFER, 2).with_shared_transport(shared.clone());

    let report = driver.run(20);
    assert_eq!(report.role, ClockRole::Follower);
    assert_eq!(engine.tempo_source(), TempoSource::External);
    assert_eq!(engine.external_bpm(), 100.0);
    assert_eq!(report.final_bpm, 100.0);
    assert!(engine.is_playing());

    // 28800 frames per beat at 100 bpm, so both sides count the same beats
    assert!((engine.position() - shared.frame()).abs() < 32);
    let beats = engine.current_tick() / 48.0;
    let shared_beats = shared.frame() as f64 / 28_800.0;
    assert_abs_diff_eq!(beats, shared_beats, epsilon = 1e-3);
}

#[test]
fn follower_ignores_timeline() {
    let engine = engine();
    let controller = engine.controller();
    controller.add_tempo_marker(0, 150.0);
    controller.activate_timeline(true);
    assert!(engine.is_timeline_enabled());

    let shared = SimulatedTransport::new(SAMPLE_RATE);
    shared.install_foreign_leader(90.0);
    engine.enable_external_transport(Box::new(shared.client()), false);
    let mut driver = OfflineDriver::new(&engine, BUFFER, 2).with_shared_transport(shared.clone());

    let report = driver.run(2);
    assert_eq!(report.final_bpm, 90.0);
    assert!(!engine.is_timeline_enabled());
    assert!(engine.is_timeline_activated());
}

#[test]
fn connection_loss_drops_external_tempo() {
    let engine = engine();
    let shared = SimulatedTransport::new(SAMPLE_RATE);
    shared.install_foreign_leader(100.0);
    shared.set_rolling(true);
    engine.enable_external_transport(Box::new(shared.client()), false);
    let mut driver = OfflineDriver::new(&engine, BUFFER, 2).with_shared_transport(shared.clone());

    driver.run(5);
    assert_eq!(engine.clock_role(), ClockRole::Follower);

    shared.disconnect();
    let report = driver.run(1);
    assert_eq!(report.role, ClockRole::None);
    assert!(engine.external_bpm().is_nan());
    assert_eq!(report.final_bpm, 120.0);
    // Playback continues on the local clock
    let before = engine.position();
    driver.run(1);
    assert_eq!(engine.position(), before + BUFFER as i64);

    shared.reconnect();
    let report = driver.run(1);
    assert_eq!(report.role, ClockRole::Follower);
    assert_eq!(report.final_bpm, 100.0);
}

#[test]
fn relocation_goes_through_the_shared_transport() {
    let engine = engine();
    let shared = SimulatedTransport::new(SAMPLE_RATE);
    engine.enable_external_transport(Box::new(shared.client()), true);
    let mut driver = OfflineDriver::new(&engine, BUFFER, 2).with_shared_transport(shared.clone());
    let controller = engine.controller();
    controller.start();
    driver.run(4);

    controller.relocate(96_000);
    driver.run(1);
    assert_eq!(shared.frame(), 96_000 + BUFFER as i64);
    assert_eq!(engine.position(), shared.frame());
    assert!(engine.is_playing());

    controller.stop();
    driver.run(2);
    assert!(!shared.is_rolling());
    assert!(!engine.is_playing());
    assert_eq!(engine.position(), shared.frame());
}

#[test]
fn pending_relocation_follows_leader_tempo_change() {
    let engine = engine();
    let shared = SimulatedTransport::new(SAMPLE_RATE);
    shared.install_foreign_leader(100.0);
    engine.enable_external_transport(Box::new(shared.client()), false);
    let mut driver = OfflineDriver::new(&engine, BUFFER, 2).with_shared_transport(shared.clone());
    driver.run(1);
    assert_eq!(engine.clock_role(), ClockRole::Follower);

    // Column 2 starts at tick 384, requested at 600 frames per tick
    engine.controller().locate_to_column(2).unwrap();
    shared.install_foreign_leader(50.0);
    driver.run(2);

    // Re-requested at 1200 frames per tick once the leader slowed down
    assert_eq!(shared.frame(), 384 * 1200);
    assert_eq!(engine.position(), 384 * 1200);
    assert_eq!(engine.current_column(), 2);
    assert_eq!(engine.current_bpm(), 50.0);
}

#[test]
fn external_start_is_adopted() {
    let engine = engine();
    let shared = SimulatedTransport::new(SAMPLE_RATE);
    engine.enable_external_transport(Box::new(shared.client()), false);
    let mut driver = OfflineDriver::new(&engine, BUFFER, 2).with_shared_transport(shared.clone());

    driver.run(2);
    assert!(!engine.is_playing());

    // Another client starts the shared transport
    shared.locate(24_000);
    shared.set_rolling(true);
    driver.run(1);
    assert!(engine.is_playing());
    assert_eq!(engine.position(), 24_000 + BUFFER as i64);
    assert_eq!(engine.clock_role(), ClockRole::None);
}

#[test]
fn disabling_releases_leader_role() {
    let engine = engine();
    let shared = SimulatedTransport::new(SAMPLE_RATE);
    let client = shared.client();
    let id = client.id();
    assert!(engine.enable_external_transport(Box::new(client), true));
    assert_eq!(shared.leader_client(), Some(id));

    engine.disable_external_transport();
    assert_eq!(shared.leader_client(), None);
    assert_eq!(engine.clock_role(), ClockRole::None);
}
