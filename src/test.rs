#[cfg(test)]
mod tests {
    use crate::prelude::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn config(name: &str) -> OrchestratorConfig {
        OrchestratorConfig {
            name: Some(name.to_string()),
            registry_sweep_ms: Some(20),
            queue_poll_ms: Some(5),
            handle_term_signals: false,
            frequency: Some(200),
            logger: None,
        }
    }

    fn wait_until(what: impl Fn() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if what() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        what()
    }

    struct Idle {
        executed: Arc<AtomicUsize>,
    }

    impl Idle {
        fn new() -> (Self, Arc<AtomicUsize>) {
            let executed = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    executed: executed.clone(),
                },
                executed,
            )
        }
    }

    impl RoutineModel for Idle {
        fn execute(&mut self, _ctl: &RoutineCtl) -> anyhow::Result<()> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Counts frames and shuts its own node down after `target`
    /// executes, timestamping the first and last frame.
    struct Metronome {
        executed: Arc<AtomicUsize>,
        target: usize,
        window: Arc<Mutex<(Option<Instant>, Option<Instant>)>>,
    }

    impl RoutineModel for Metronome {
        fn execute(&mut self, ctl: &RoutineCtl) -> anyhow::Result<()> {
            let n = self.executed.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 1 {
                self.window.lock().0 = Some(Instant::now());
            }
            if n == self.target {
                self.window.lock().1 = Some(Instant::now());
                ctl.request_shutdown()?;
            }
            Ok(())
        }
    }

    #[test]
    fn paced_routine_holds_its_frequency_end_to_end() {
        let orch = Orchestrator::spawn(config("e2e-pace")).unwrap();
        let executed = Arc::new(AtomicUsize::new(0));
        let window = Arc::new(Mutex::new((None, None)));
        let leaf = Routine::with_options(
            "metronome",
            Box::new(Metronome {
                executed: executed.clone(),
                target: 100,
                window: window.clone(),
            }),
            RoutineOptions {
                frequency: Some(100),
                inherit_rate: false,
                ..RoutineOptions::default()
            },
        )
        .unwrap();

        orch.register_routine(leaf.clone()).unwrap();
        assert!(wait_until(
            || leaf.core().has_parent(),
            Duration::from_secs(2)
        ));

        orch.request_trigger(ControlState::Executing, "default")
            .unwrap();
        assert!(wait_until(
            || leaf.state() == ControlState::Shutdown,
            Duration::from_secs(10)
        ));
        leaf.join();

        assert_eq!(executed.load(Ordering::SeqCst), 100);
        let (start, end) = *window.lock();
        let elapsed = end.unwrap().duration_since(start.unwrap());
        // 99 paced cycles at 100Hz are 0.99s on paper; allow generous
        // scheduler slop both ways.
        assert!(
            (0.5..2.0).contains(&elapsed.as_secs_f64()),
            "elapsed {elapsed:?}"
        );

        // The full phase tour ran.
        assert_eq!(leaf.phase(), Phase::Destroy);
        for phase in [
            Phase::Init,
            Phase::Ready,
            Phase::Execute,
            Phase::Pause,
            Phase::Stop,
            Phase::Destroy,
        ] {
            assert!(leaf.phase_duration(phase).is_some(), "{phase} never ran");
        }

        assert_eq!(orch.exit(false).get(), Some(()));
    }

    // Ten-second soak; run with `cargo test -- --ignored`.
    #[test]
    #[ignore]
    fn long_run_holds_sixty_hertz_within_ten_percent() {
        let orch = Orchestrator::spawn(config("e2e-soak")).unwrap();
        let executed = Arc::new(AtomicUsize::new(0));
        let window = Arc::new(Mutex::new((None, None)));
        let leaf = Routine::with_options(
            "metronome60",
            Box::new(Metronome {
                executed: executed.clone(),
                target: 600,
                window: window.clone(),
            }),
            RoutineOptions {
                frequency: Some(60),
                inherit_rate: false,
                ..RoutineOptions::default()
            },
        )
        .unwrap();

        orch.register_routine(leaf.clone()).unwrap();
        assert!(wait_until(
            || leaf.core().has_parent(),
            Duration::from_secs(2)
        ));

        orch.request_trigger(ControlState::Executing, "default")
            .unwrap();
        assert!(wait_until(
            || leaf.state() == ControlState::Shutdown,
            Duration::from_secs(30)
        ));
        leaf.join();

        assert_eq!(executed.load(Ordering::SeqCst), 600);
        let (start, end) = *window.lock();
        let elapsed = end.unwrap().duration_since(start.unwrap()).as_secs_f64();
        // 599 paced intervals at 60Hz are 9.983s on paper.
        let nominal = 599.0 / 60.0;
        assert!(
            (elapsed - nominal).abs() <= nominal * 0.10,
            "elapsed {elapsed:.3}s, nominal {nominal:.3}s"
        );

        assert_eq!(orch.exit(false).get(), Some(()));
    }

    #[test]
    fn named_group_cascade_survives_a_full_tour() {
        let orch = Orchestrator::spawn(config("e2e-band")).unwrap();
        let (drum_model, drum_beats) = Idle::new();
        let (bass_model, bass_beats) = Idle::new();
        let drum = Routine::new("drum", drum_model).unwrap();
        let bass = Routine::new("bass", bass_model).unwrap();

        orch.register_routine_in_named_group(drum.clone(), "band")
            .unwrap();
        orch.register_routine_in_named_group(bass.clone(), "band")
            .unwrap();
        assert!(wait_until(
            || drum.core().has_parent() && bass.core().has_parent(),
            Duration::from_secs(2)
        ));
        let band = orch.find_group("band").unwrap();
        assert_eq!(band.len(), 2);
        assert_eq!(drum.path(), "e2e-band.band.drum");

        orch.request_trigger(ControlState::Executing, "band").unwrap();
        assert!(wait_until(
            || drum.state() == ControlState::Executing && bass.state() == ControlState::Executing,
            Duration::from_secs(3)
        ));
        assert!(wait_until(
            || drum_beats.load(Ordering::SeqCst) > 0 && bass_beats.load(Ordering::SeqCst) > 0,
            Duration::from_secs(3)
        ));

        orch.request_trigger(ControlState::Paused, "band").unwrap();
        assert!(wait_until(
            || drum.state() == ControlState::Paused && bass.state() == ControlState::Paused,
            Duration::from_secs(3)
        ));
        let frozen = drum_beats.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(drum_beats.load(Ordering::SeqCst), frozen);

        assert_eq!(orch.exit(false).get(), Some(()));
        assert!(orch.is_terminated());
        assert_eq!(drum.state(), ControlState::Shutdown);
        assert_eq!(bass.state(), ControlState::Shutdown);
        assert_eq!(band.state(), ControlState::Shutdown);
        drum.join();
        bass.join();

        assert!(matches!(
            orch.request_trigger(ControlState::Executing, "band"),
            Err(ControlError::Unavailable)
        ));
    }

    #[test]
    fn blocked_workers_publish_their_suspension_point() {
        let orch = Orchestrator::spawn(config("e2e-susp")).unwrap();
        let (model, _) = Idle::new();
        let leaf = Routine::new("sleeper", model).unwrap();
        orch.register_routine(leaf.clone()).unwrap();
        assert!(wait_until(
            || leaf.core().has_parent(),
            Duration::from_secs(2)
        ));
        assert_eq!(leaf.suspension(), SuspensionPoint::NotStarted);

        // Pausing the default group starts the leaf's worker, which
        // immediately parks on the pause condition.
        orch.request_trigger(ControlState::Paused, "default").unwrap();
        assert!(wait_until(
            || leaf.suspension() == SuspensionPoint::BlockedOnPause,
            Duration::from_secs(3)
        ));

        let report = orch.status_report();
        assert!(report.contains("group 'default' [Paused]"), "{report}");
        assert!(report.contains("'sleeper' [Paused]"), "{report}");

        assert_eq!(orch.exit(false).get(), Some(()));
        assert_eq!(leaf.suspension(), SuspensionPoint::Exited);
    }
}
