//! The blocking side of a generation session.

mod executor;

pub use executor::SessionExecutor;

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use genstream_core::event::check_grammar;
    use genstream_core::{
        Artifact, Engine, EngineError, GenerationError, GenerationParams, InterruptCheck,
        InterruptFlag, InterruptReason, OverlaySpec, PreviewPolicy, ProgramCatalog, ProgramId,
        ProgramSpec, RawParams, SessionId, SessionRecord, SessionState, StepControl, StepEvent,
        StepUpdate, step_channel,
    };
    use genstream_infrastructure::{SimulatedEngine, SimulatedEngineConfig};

    struct Fixture {
        engine: Arc<SimulatedEngine>,
        params: GenerationParams,
        record: SessionRecord,
    }

    fn fixture(config: SimulatedEngineConfig, steps: u32, preview: PreviewPolicy) -> Fixture {
        let spec = ProgramCatalog::builtin()
            .get(&ProgramId::new("P4"))
            .unwrap()
            .clone();
        let raw = RawParams {
            steps: Some(steps),
            seed: Some(3),
            preview: Some(preview),
            ..RawParams::default()
        };
        Fixture {
            engine: Arc::new(SimulatedEngine::new(config)),
            params: GenerationParams::resolve(&spec, raw).unwrap(),
            record: SessionRecord::new(SessionId::new(), spec.id.clone(), None),
        }
    }

    /// Runs the executor on a blocking thread while draining events on this task.
    async fn execute(
        mut fx: Fixture,
        check: InterruptCheck,
    ) -> (Vec<StepEvent>, SessionState, SessionRecord) {
        let (sender, stream) = step_channel(fx.record.session_id, 2);
        let worker = tokio::task::spawn_blocking(move || {
            let spec = ProgramCatalog::builtin()
                .get(&fx.params.program_id)
                .unwrap()
                .clone();
            let mut pipeline = fx.engine.load_pipeline(&spec).unwrap();
            let executor = super::SessionExecutor::new(fx.engine.clone());
            let state = executor.run(&mut pipeline, &fx.params, &check, &mut fx.record, sender);
            (state, fx.record)
        });
        let events = stream.collect_events().await;
        let (state, record) = worker.await.unwrap();
        (events, state, record)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn completes_with_progress_and_previews() {
        let fx = fixture(SimulatedEngineConfig::default(), 5, PreviewPolicy::EveryStep);
        let (events, state, record) = execute(fx, InterruptCheck::new(InterruptFlag::new())).await;

        assert_eq!(state, SessionState::Completed);
        check_grammar(&events).unwrap();
        let progress = events.iter().filter(|e| matches!(e, StepEvent::Progress { .. })).count();
        let previews = events.iter().filter(|e| matches!(e, StepEvent::Preview { .. })).count();
        assert_eq!((progress, previews), (5, 5));
        assert!(matches!(events[events.len() - 2], StepEvent::Final { .. }));
        assert_eq!(record.current_step(), 5);
        assert_eq!(record.step_durations().len(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn final_only_skips_previews() {
        let fx = fixture(SimulatedEngineConfig::default(), 3, PreviewPolicy::FinalOnly);
        let (events, state, _) = execute(fx, InterruptCheck::new(InterruptFlag::new())).await;
        assert_eq!(state, SessionState::Completed);
        assert!(!events.iter().any(|e| matches!(e, StepEvent::Preview { .. })));
        assert_eq!(events.len(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn raised_flag_before_start_runs_no_steps() {
        let fx = fixture(SimulatedEngineConfig::default(), 3, PreviewPolicy::EveryStep);
        let engine = fx.engine.clone();
        let flag = InterruptFlag::new();
        flag.raise(InterruptReason::Superseded);
        let (events, state, record) = execute(fx, InterruptCheck::new(flag)).await;

        assert_eq!(state, SessionState::Interrupted);
        assert_eq!(record.interrupt_reason(), Some(InterruptReason::Superseded));
        assert_eq!(
            events[0],
            StepEvent::Error { cause: "interrupted before start: superseded".into() }
        );
        assert_eq!(engine.stats().runs, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn interrupt_mid_run_stops_at_step_boundary() {
        let fx = fixture(
            SimulatedEngineConfig {
                step_delay: Duration::from_millis(20),
                ..SimulatedEngineConfig::default()
            },
            50,
            PreviewPolicy::FinalOnly,
        );
        let flag = InterruptFlag::new();
        let (sender, mut stream) = step_channel(fx.record.session_id, 2);
        let check = InterruptCheck::new(flag.clone());
        let Fixture { engine, params, mut record } = fx;
        let worker = tokio::task::spawn_blocking(move || {
            let spec = ProgramCatalog::builtin().get(&params.program_id).unwrap().clone();
            let mut pipeline = engine.load_pipeline(&spec).unwrap();
            let state = super::SessionExecutor::new(engine)
                .run(&mut pipeline, &params, &check, &mut record, sender);
            (state, record)
        });

        let mut events = Vec::new();
        while let Some(event) = stream.next_event().await {
            if matches!(event, StepEvent::Progress { step: 2, .. }) {
                flag.raise(InterruptReason::Requested);
            }
            events.push(event);
        }
        let (state, record) = worker.await.unwrap();

        assert_eq!(state, SessionState::Interrupted);
        check_grammar(&events).unwrap();
        // At most the two buffered steps plus the one blocked in send.
        assert!(record.current_step() <= 5);
        assert_eq!(
            events[events.len() - 2],
            StepEvent::Error { cause: "interrupted: requested".into() }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn partial_output_on_interrupt_is_final() {
        let fx = fixture(
            SimulatedEngineConfig {
                partial_output: true,
                ..SimulatedEngineConfig::default()
            },
            10,
            PreviewPolicy::FinalOnly,
        );
        // Connection "dies" after the first step.
        struct AfterFirst(std::sync::atomic::AtomicU32);
        impl genstream_core::LivenessProbe for AfterFirst {
            fn check(&self) -> Option<InterruptReason> {
                let n = self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                (n >= 1).then_some(InterruptReason::Disconnected)
            }
        }
        let flag = InterruptFlag::new();
        let probe = Arc::new(AfterFirst(std::sync::atomic::AtomicU32::new(0)));
        let (events, state, record) = execute(fx, InterruptCheck::with_probe(flag.clone(), probe)).await;

        assert_eq!(state, SessionState::Interrupted);
        assert_eq!(record.interrupt_reason(), Some(InterruptReason::Disconnected));
        assert_eq!(flag.reason(), Some(InterruptReason::Disconnected));
        assert!(matches!(events[events.len() - 2], StepEvent::Final { .. }));
        check_grammar(&events).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn engine_fault_fails_session() {
        let fx = fixture(
            SimulatedEngineConfig {
                fail_at_step: Some(3),
                ..SimulatedEngineConfig::default()
            },
            5,
            PreviewPolicy::EveryStep,
        );
        let (events, state, _) = execute(fx, InterruptCheck::new(InterruptFlag::new())).await;
        assert_eq!(state, SessionState::Failed);
        check_grammar(&events).unwrap();
        match &events[events.len() - 2] {
            StepEvent::Error { cause } => {
                assert!(cause.starts_with("Engine fault:"), "{cause}");
                assert!(cause.contains("step 3"));
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn engine_panic_is_contained() {
        let fx = fixture(
            SimulatedEngineConfig {
                panic_at_step: Some(2),
                ..SimulatedEngineConfig::default()
            },
            5,
            PreviewPolicy::EveryStep,
        );
        let (events, state, _) = execute(fx, InterruptCheck::new(InterruptFlag::new())).await;
        assert_eq!(state, SessionState::Failed);
        check_grammar(&events).unwrap();
        match &events[events.len() - 2] {
            StepEvent::Error { cause } => assert!(cause.starts_with("engine panicked")),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn preview_failure_is_skipped() {
        let fx = fixture(
            SimulatedEngineConfig {
                fail_preview: true,
                ..SimulatedEngineConfig::default()
            },
            3,
            PreviewPolicy::EveryStep,
        );
        let (events, state, _) = execute(fx, InterruptCheck::new(InterruptFlag::new())).await;
        assert_eq!(state, SessionState::Completed);
        assert!(!events.iter().any(|e| matches!(e, StepEvent::Preview { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_consumer_interrupts() {
        let fx = fixture(SimulatedEngineConfig::default(), 20, PreviewPolicy::EveryStep);
        let flag = InterruptFlag::new();
        let check = InterruptCheck::new(flag.clone());
        let (sender, stream) = step_channel(fx.record.session_id, 2);
        drop(stream);
        let Fixture { engine, params, mut record } = fx;
        let state = tokio::task::spawn_blocking(move || {
            let spec = ProgramCatalog::builtin().get(&params.program_id).unwrap().clone();
            let mut pipeline = engine.load_pipeline(&spec).unwrap();
            super::SessionExecutor::new(engine).run(&mut pipeline, &params, &check, &mut record, sender)
        })
        .await
        .unwrap();

        assert_eq!(state, SessionState::Interrupted);
        assert_eq!(flag.reason(), Some(InterruptReason::ConsumerGone));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stalled_consumer_is_released_by_interrupt() {
        let fx = fixture(SimulatedEngineConfig::default(), 50, PreviewPolicy::EveryStep);
        let flag = InterruptFlag::new();
        let check = InterruptCheck::new(flag.clone());
        // held but never read
        let (sender, stream) = step_channel(fx.record.session_id, 2);
        let Fixture { engine, params, mut record } = fx;
        let worker = tokio::task::spawn_blocking(move || {
            let spec = ProgramCatalog::builtin().get(&params.program_id).unwrap().clone();
            let mut pipeline = engine.load_pipeline(&spec).unwrap();
            let state = super::SessionExecutor::new(engine)
                .run(&mut pipeline, &params, &check, &mut record, sender);
            (state, record)
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!worker.is_finished());
        flag.raise(InterruptReason::Disconnected);

        let (state, record) = tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("worker stayed blocked on a full channel")
            .unwrap();
        assert_eq!(state, SessionState::Interrupted);
        assert_eq!(record.interrupt_reason(), Some(InterruptReason::Disconnected));
        assert!(record.current_step() < 50);
        drop(stream);
    }

    /// Reports steps 2 then 1.
    struct Regressing;

    impl Engine for Regressing {
        type Pipeline = ();
        type Latents = ();

        fn load_pipeline(&self, _spec: &ProgramSpec) -> Result<(), EngineError> {
            Ok(())
        }

        fn load_overlay(&self, _pipeline: &mut (), _overlay: &OverlaySpec) -> Result<(), EngineError> {
            Ok(())
        }

        fn unload_overlay(&self, _pipeline: &mut ()) -> Result<(), EngineError> {
            Ok(())
        }

        fn run_steps(
            &self,
            _pipeline: &mut (),
            _params: &GenerationParams,
            on_step: &mut dyn FnMut(StepUpdate<'_, ()>) -> StepControl,
        ) -> Result<Artifact, EngineError> {
            for step in [2, 1] {
                on_step(StepUpdate { step, timestep: 0, latents: &() });
            }
            Ok(Artifact { image: Vec::new(), steps_completed: 2 })
        }

        fn decode_preview(&self, _latents: &()) -> Result<Vec<u8>, EngineError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn step_regression_is_not_contained() {
        let fx = fixture(SimulatedEngineConfig::default(), 4, PreviewPolicy::FinalOnly);
        let Fixture { params, mut record, .. } = fx;
        let (sender, stream) = step_channel(record.session_id, 4);
        let check = InterruptCheck::new(InterruptFlag::new());
        let worker = tokio::task::spawn_blocking(move || {
            super::SessionExecutor::new(Arc::new(Regressing))
                .run(&mut (), &params, &check, &mut record, sender)
        });

        let events = stream.collect_events().await;
        let err = worker.await.unwrap_err();
        assert!(err.is_panic());
        let payload = err.into_panic();
        assert!(matches!(
            payload.downcast_ref::<GenerationError>(),
            Some(GenerationError::ChannelProtocolViolation(_))
        ));
        assert_eq!(events[0], StepEvent::Progress { step: 2, timestep: 0 });
        assert_eq!(events.last(), Some(&StepEvent::Done { state: SessionState::Failed }));
        check_grammar(&events).unwrap();
    }
}
