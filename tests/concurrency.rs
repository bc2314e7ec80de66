//! Operator commands racing the poller on one serial line.

use std::{sync::Arc, thread, time::Duration};

use cryo_hv::{
    codec::CharEchoCodec,
    config::{PollingConfig, ShutdownConfig},
    error::Error,
    events::EventBus,
    module::{HvModule, ModuleOptions},
    notify::RecordingNotifier,
    shutdown::{EmergencyShutdown, Supervisor},
    sim::{SimHandle, SimulatedCharEcho},
};

const CHANNELS: u8 = 4;

fn supervised() -> (Arc<Supervisor>, Arc<HvModule>, SimHandle) {
    let events = EventBus::new();
    let notifier = Arc::new(RecordingNotifier::new());
    let supervisor = Arc::new(Supervisor::new(
        PollingConfig {
            interval_ms: 1,
            full_refresh_every: 3,
            occupancy_wait_ms: 5000,
        },
        ShutdownConfig { max_ramp_rate: 100.0 },
        events.clone(),
        notifier.clone(),
    ));
    let device = SimulatedCharEcho::new(CHANNELS);
    let sim = device.handle();
    let module = Arc::new(
        HvModule::new(
            "hv-a",
            "sim",
            Box::new(CharEchoCodec::new(device)),
            ModuleOptions {
                channels: CHANNELS,
                ..Default::default()
            },
            events,
            notifier,
        )
        .unwrap(),
    );
    supervisor.add_module(module.clone());
    (supervisor, module, sim)
}

#[test]
fn one_exchange_in_flight_under_load() {
    let (_supervisor, module, sim) = supervised();

    let ticker = {
        let sim = sim.clone();
        thread::spawn(move || {
            for _ in 0..200 {
                sim.tick(Duration::from_millis(100));
                thread::sleep(Duration::from_millis(1));
            }
        })
    };
    let writers: Vec<_> = (0..CHANNELS)
        .map(|index| {
            let module = module.clone();
            thread::spawn(move || {
                for step in 0..40u32 {
                    module
                        .set_ramp_rate(index, 10.0 + f64::from(step))
                        .unwrap();
                    module
                        .set_voltage(index, 100.0 * f64::from(index + 1) + f64::from(step))
                        .unwrap();
                    module.start_ramp(index).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    ticker.join().unwrap();

    // Interleaved bytes from two exchanges would leave unparseable commands.
    assert_eq!(sim.garbled(), 0);
    for index in 0..CHANNELS {
        let channel = sim.channel(usize::from(index)).unwrap();
        assert_eq!(channel.set_point, 100.0 * f64::from(index + 1) + 39.0);
        assert_eq!(channel.ramp_rate, 49.0);
    }
    assert!(module.wait_idle(Duration::from_secs(1)));
}

#[test]
fn shutdown_preempts_running_commands() {
    let (supervisor, module, sim) = supervised();
    for index in 0..CHANNELS {
        module.set_voltage(index, 500.0).unwrap();
        module.start_ramp(index).unwrap();
    }
    sim.tick(Duration::from_secs(100));

    let writers: Vec<_> = (0..CHANNELS)
        .map(|index| {
            let module = module.clone();
            thread::spawn(move || {
                let mut failures = Vec::new();
                for step in 0..20u32 {
                    if let Err(e) = module.set_voltage(index, 400.0 + f64::from(step)) {
                        failures.push(e);
                    }
                }
                failures
            })
        })
        .collect();
    supervisor.kill_all_hv("load test").unwrap();

    for writer in writers {
        for failure in writer.join().unwrap() {
            // Only the post-shutdown inhibit may refuse a set-point.
            assert!(matches!(failure, Error::Rejected(_)), "{failure}");
        }
    }
    assert_eq!(sim.garbled(), 0);
    assert!(!module.auto_ramp_enabled());

    // A second shutdown after the dust settles leaves everything heading to zero.
    supervisor.kill_all_hv("load test, again").unwrap();
    sim.tick(Duration::from_secs(100));
    for index in 0..CHANNELS {
        assert_eq!(sim.channel(usize::from(index)).unwrap().voltage, 0.0);
    }
}
