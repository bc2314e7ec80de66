//! End-to-end scenarios against the simulated modules.

use std::{sync::Arc, time::Duration};

use cryo_hv::{
    channel::TripKind,
    codec::{CharEchoCodec, HvCodec, ScpiCodec},
    config::{InterlockConfig, PollingConfig, ShutdownConfig},
    events::{EventBus, HvEvent},
    interlock::{InterlockMonitor, MemoryTelemetry},
    module::{HvModule, ModuleOptions},
    notify::RecordingNotifier,
    register::ChannelStatus,
    shutdown::{EmergencyShutdown, Supervisor},
    sim::{SimHandle, SimulatedCharEcho, SimulatedScpi},
};

fn family_a_module(channels: u8, events: EventBus) -> (HvModule, SimHandle) {
    let device = SimulatedCharEcho::new(channels);
    let sim = device.handle();
    let module = HvModule::new(
        "hv-a",
        "sim",
        Box::new(CharEchoCodec::new(device)),
        ModuleOptions {
            channels,
            ..Default::default()
        },
        events,
        Arc::new(RecordingNotifier::new()),
    )
    .unwrap();
    (module, sim)
}

#[test]
fn family_a_set_point_reads_back() {
    let device = SimulatedCharEcho::new(1);
    let mut codec = CharEchoCodec::new(device);
    codec.set_voltage(0, 1000.0).unwrap();
    assert_eq!(codec.exchange("D1").unwrap(), "1000");
}

#[test]
fn family_b_set_point_reads_back_scaled() {
    let device = SimulatedScpi::new(1);
    let mut codec = ScpiCodec::new(device);
    codec.set_voltage(0, 500.0).unwrap();
    assert_eq!(codec.query("READ:VOLT? (@0)").unwrap(), "0.5E3V");
}

#[test]
fn ramp_reaches_target_at_rate() {
    let (module, sim) = family_a_module(1, EventBus::new());
    module.refresh_full();
    module.set_ramp_rate(0, 10.0).unwrap();
    module.set_voltage(0, 1000.0).unwrap();
    assert_eq!(module.start_ramp(0).unwrap(), ChannelStatus::RampUp);

    for second in 1..=100 {
        sim.tick(Duration::from_secs(1));
        module.refresh_full();
        let channel = module.channel(0).unwrap();
        let measured = channel.measured_voltage().unwrap();
        if second == 50 {
            assert!((measured - 500.0).abs() <= 10.0, "at 50 s: {measured}");
        }
        if second < 100 {
            assert_eq!(channel.status(), ChannelStatus::RampUp, "at {second} s");
        }
    }
    let channel = module.channel(0).unwrap();
    assert_eq!(channel.measured_voltage(), Some(1000.0));
    assert_eq!(channel.status(), ChannelStatus::On);
}

#[test]
fn ramps_converge_within_one_step() {
    for (target, rate) in [(1000.0, 10.0), (750.0, 40.0), (333.0, 25.0), (20.0, 50.0)] {
        let (module, sim) = family_a_module(1, EventBus::new());
        module.refresh_full();
        module.set_ramp_rate(0, rate).unwrap();
        module.set_voltage(0, target).unwrap();
        module.start_ramp(0).unwrap();

        let steps = (target / rate).ceil() as u32;
        for _ in 0..steps {
            assert_ne!(module.channel(0).unwrap().status(), ChannelStatus::On);
            sim.tick(Duration::from_secs(1));
            module.refresh_full();
        }
        let channel = module.channel(0).unwrap();
        assert_eq!(channel.measured_voltage(), Some(target));
        assert_eq!(channel.status(), ChannelStatus::On);
    }
}

#[test]
fn ramp_down_to_lower_set_point() {
    let (module, sim) = family_a_module(1, EventBus::new());
    module.refresh_full();
    module.set_voltage(0, 800.0).unwrap();
    module.start_ramp(0).unwrap();
    sim.tick(Duration::from_secs(100));
    module.refresh_full();
    assert_eq!(module.channel(0).unwrap().status(), ChannelStatus::On);

    module.set_voltage(0, 200.0).unwrap();
    assert_eq!(module.channel(0).unwrap().status(), ChannelStatus::RampDown);
    sim.tick(Duration::from_secs(100));
    module.refresh_full();
    let channel = module.channel(0).unwrap();
    assert_eq!(channel.measured_voltage(), Some(200.0));
    assert_eq!(channel.status(), ChannelStatus::On);
}

#[test]
fn trip_survives_polling_until_cleared() {
    let events = EventBus::new();
    let trips = events.subscribe();
    let (module, sim) = family_a_module(1, events);
    module.set_voltage(0, 600.0).unwrap();
    module.start_ramp(0).unwrap();
    sim.tick(Duration::from_secs(100));
    module.refresh_full();

    sim.trip(0);
    for _ in 0..20 {
        module.refresh_full();
        assert!(module.channel(0).unwrap().tripped());
    }
    let tripped = trips
        .try_iter()
        .filter(|e| matches!(e, HvEvent::ChannelTripped { .. }))
        .count();
    assert_eq!(tripped, 1);

    module.clear_trip(0).unwrap();
    module.refresh_full();
    assert!(!module.channel(0).unwrap().tripped());
}

#[test]
fn hardware_inhibit_is_reported() {
    let (module, sim) = family_a_module(2, EventBus::new());
    sim.set_inhibit(1, true);
    module.refresh_full();
    assert!(!module.channel(0).unwrap().hardware_inhibit());
    assert!(module.channel(1).unwrap().hardware_inhibit());

    sim.set_inhibit(1, false);
    module.refresh_full();
    assert!(!module.channel(1).unwrap().hardware_inhibit());
}

#[test]
fn repeated_trips_are_classified_frequent() {
    let events = EventBus::new();
    let trips = events.subscribe();
    let (module, sim) = family_a_module(1, events);
    module.set_voltage(0, 100.0).unwrap();
    module.start_ramp(0).unwrap();
    sim.set_periodic_trip(Some(Duration::from_secs(30)));

    for _ in 0..2 {
        sim.tick(Duration::from_secs(30));
        module.refresh_full();
        assert!(module.channel(0).unwrap().tripped());
        module.clear_trip(0).unwrap();
        module.start_ramp(0).unwrap();
    }
    let kinds: Vec<TripKind> = trips
        .try_iter()
        .filter_map(|e| match e {
            HvEvent::ChannelTripped { kind, .. } => Some(kind),
            _ => None,
        })
        .collect();
    assert!(matches!(kinds.as_slice(), [TripKind::Isolated, TripKind::Frequent]));
    assert_eq!(module.channel(0).unwrap().trips().timestamps().len(), 2);
}

#[test]
fn interlock_kills_hv_once() {
    let events = EventBus::new();
    let shutdowns = events.subscribe();
    let notifier = RecordingNotifier::new();
    let supervisor = Arc::new(Supervisor::new(
        PollingConfig {
            interval_ms: 5,
            full_refresh_every: 1,
            occupancy_wait_ms: 2000,
        },
        ShutdownConfig { max_ramp_rate: 500.0 },
        events.clone(),
        Arc::new(notifier.clone()),
    ));
    let device = SimulatedScpi::new(2);
    let sim = device.handle();
    let module = Arc::new(
        HvModule::new(
            "hv-b",
            "sim",
            Box::new(ScpiCodec::new(device)),
            ModuleOptions {
                channels: 2,
                ..Default::default()
            },
            events.clone(),
            Arc::new(notifier.clone()),
        )
        .unwrap(),
    );
    supervisor.add_module(module.clone());
    module.set_voltage(0, 1500.0).unwrap();
    module.turn_on(0).unwrap();
    sim.tick(Duration::from_secs(60));

    let telemetry = MemoryTelemetry::new();
    telemetry.record("cryostat_level", 2.0);
    let monitor = InterlockMonitor::new(
        InterlockConfig {
            parameter: "cryostat_level".into(),
            threshold: 3.0,
            max_staleness_s: 60,
            interval_ms: 100,
        },
        Arc::new(telemetry.clone()),
        supervisor.clone() as Arc<dyn EmergencyShutdown>,
        Arc::new(notifier.clone()),
        events.clone(),
    );

    assert!(!monitor.evaluate());
    assert!(!monitor.evaluate());
    assert!(!monitor.state().lock_state);
    assert!(!monitor.state().armed);

    let fired = shutdowns
        .try_iter()
        .filter(|e| matches!(e, HvEvent::EmergencyShutdown { .. }))
        .count();
    assert_eq!(fired, 1);
    assert!(!module.auto_ramp_enabled());

    sim.tick(Duration::from_secs(10));
    assert_eq!(sim.channel(0).unwrap().voltage, 0.0);
    assert!(!sim.channel(0).unwrap().hv_on);
}
