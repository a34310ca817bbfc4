use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use genstream_core::{
    Engine, GenerationError, InterruptFlag, OverlaySpec, ProgramId, ProgramSpec, Result,
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// What a slot holds once its pipeline is built.
struct Loaded<E: Engine> {
    pipeline: E::Pipeline,
    overlay: Option<OverlaySpec>,
}

type SlotState<E> = Arc<AsyncMutex<Option<Loaded<E>>>>;

/// Observable state of one program's context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Never built, evicted, or construction failed.
    Absent,
    Idle,
    /// Held by a lease, or being constructed.
    InUse,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Contexts with a built pipeline, idle or in use.
    pub cached: usize,
    pub in_use: usize,
    pub constructions: usize,
    pub overlay_swaps: usize,
    pub evictions: usize,
}

#[derive(Debug, Default)]
struct Counters {
    constructions: AtomicUsize,
    overlay_swaps: AtomicUsize,
    evictions: AtomicUsize,
}

/// Process-wide pool of pipeline contexts, one per program.
///
/// Each program has a slot guarded by an async mutex. Holding the slot's lock
/// *is* holding the context: at most one [`PipelineLease`] exists per program
/// at any time, and later acquirers wait in FIFO order. The first acquirer
/// builds the pipeline while holding the lock, so concurrent first requests
/// construct it exactly once.
pub struct PipelineCache<E: Engine> {
    engine: Arc<E>,
    slots: Mutex<HashMap<ProgramId, SlotState<E>>>,
    counters: Arc<Counters>,
}

impl<E: Engine> PipelineCache<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self {
            engine,
            slots: Mutex::new(HashMap::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// The engine every cached pipeline was built with.
    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    fn slot(&self, id: &ProgramId) -> SlotState<E> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            slots
                .entry(id.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(None))),
        )
    }

    fn snapshot(&self) -> Vec<(ProgramId, SlotState<E>)> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect()
    }

    /// Acquires exclusive use of the program's context, building it if needed.
    ///
    /// Waits while another lease holds the context.
    ///
    /// # Errors
    ///
    /// Returns `GenerationError::ResourceUnavailable` if the pipeline cannot be
    /// built. The slot stays empty and the next acquire retries.
    pub async fn acquire(&self, spec: &ProgramSpec) -> Result<PipelineLease<E>> {
        let guard = self.slot(&spec.id).lock_owned().await;
        self.prepare(guard, spec).await
    }

    /// Like [`acquire`](Self::acquire) but gives up with `Ok(None)` if `flag`
    /// is raised while waiting for the context.
    ///
    /// Once the context is obtained, construction is not cancelled.
    pub async fn acquire_unless(
        &self,
        spec: &ProgramSpec,
        flag: &InterruptFlag,
    ) -> Result<Option<PipelineLease<E>>> {
        if flag.is_raised() {
            return Ok(None);
        }
        let slot = self.slot(&spec.id);
        let guard = tokio::select! {
            biased;
            _ = flag.raised() => return Ok(None),
            guard = slot.lock_owned() => guard,
        };
        if flag.is_raised() {
            return Ok(None);
        }
        self.prepare(guard, spec).await.map(Some)
    }

    async fn prepare(
        &self,
        mut guard: OwnedMutexGuard<Option<Loaded<E>>>,
        spec: &ProgramSpec,
    ) -> Result<PipelineLease<E>> {
        if guard.is_none() {
            tracing::info!(target: "pipeline_cache", program_id = %spec.id, model_id = %spec.model_id, "building pipeline");
            let engine = Arc::clone(&self.engine);
            let owned_spec = spec.clone();
            let built = tokio::task::spawn_blocking(move || engine.load_pipeline(&owned_spec))
                .await
                .map_err(|err| {
                    GenerationError::resource_unavailable(spec.id.as_str(), format!("loader crashed: {err}"))
                })?
                .map_err(|err| {
                    tracing::warn!(target: "pipeline_cache", program_id = %spec.id, error = %err, "pipeline construction failed");
                    GenerationError::resource_unavailable(spec.id.as_str(), err.to_string())
                })?;
            *guard = Some(Loaded {
                pipeline: built,
                overlay: None,
            });
            self.counters.constructions.fetch_add(1, Ordering::SeqCst);
        } else {
            tracing::debug!(target: "pipeline_cache", program_id = %spec.id, "reusing cached pipeline");
        }
        Ok(PipelineLease {
            program_id: spec.id.clone(),
            engine: Arc::clone(&self.engine),
            guard: Some(guard),
            counters: Arc::clone(&self.counters),
        })
    }

    /// Drops the pipelines of all idle contexts. Never blocks.
    ///
    /// Returns the number of contexts evicted.
    pub fn evict_all(&self) -> usize {
        let mut evicted = 0;
        for (id, slot) in self.snapshot() {
            let Ok(mut guard) = slot.try_lock() else {
                tracing::debug!(target: "pipeline_cache", program_id = %id, "in use, not evicted");
                continue;
            };
            if guard.take().is_some() {
                evicted += 1;
                tracing::info!(target: "pipeline_cache", program_id = %id, "evicted");
            }
        }
        self.counters.evictions.fetch_add(evicted, Ordering::SeqCst);
        evicted
    }

    /// Reports whether `id`'s context is absent, idle or lent out.
    ///
    /// Never waits: a slot whose lock is held counts as in use.
    pub fn context_state(&self, id: &ProgramId) -> ContextState {
        let slot = {
            let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            match slots.get(id) {
                Some(slot) => Arc::clone(slot),
                None => return ContextState::Absent,
            }
        };
        match slot.try_lock() {
            Err(_) => ContextState::InUse,
            Ok(guard) if guard.is_some() => ContextState::Idle,
            Ok(_) => ContextState::Absent,
        }
    }

    /// Snapshot of the counters and of how many pipelines are cached or lent out.
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            constructions: self.counters.constructions.load(Ordering::SeqCst),
            overlay_swaps: self.counters.overlay_swaps.load(Ordering::SeqCst),
            evictions: self.counters.evictions.load(Ordering::SeqCst),
            ..CacheStats::default()
        };
        for (_, slot) in self.snapshot() {
            match slot.try_lock() {
                Err(_) => {
                    stats.in_use += 1;
                    stats.cached += 1;
                }
                Ok(guard) if guard.is_some() => stats.cached += 1,
                Ok(_) => {}
            }
        }
        stats
    }
}

impl<E: Engine> fmt::Debug for PipelineCache<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineCache")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Exclusive hold on one program's context.
///
/// Released on [`release`](Self::release) or drop, whichever comes first.
pub struct PipelineLease<E: Engine> {
    program_id: ProgramId,
    engine: Arc<E>,
    guard: Option<OwnedMutexGuard<Option<Loaded<E>>>>,
    counters: Arc<Counters>,
}

impl<E: Engine> PipelineLease<E> {
    pub fn program_id(&self) -> &ProgramId {
        &self.program_id
    }

    pub fn is_held(&self) -> bool {
        self.guard.is_some()
    }

    fn loaded(&mut self) -> Result<&mut Loaded<E>> {
        self.guard
            .as_deref_mut()
            .and_then(Option::as_mut)
            .ok_or_else(|| GenerationError::context_not_held(self.program_id.as_str()))
    }

    pub fn pipeline_mut(&mut self) -> Result<&mut E::Pipeline> {
        Ok(&mut self.loaded()?.pipeline)
    }

    pub fn overlay(&self) -> Option<&OverlaySpec> {
        self.guard.as_deref()?.as_ref()?.overlay.as_ref()
    }

    /// Makes the context carry exactly `wanted`, unloading the current
    /// overlay first if it differs. Blocking.
    ///
    /// # Errors
    ///
    /// * `ContextNotHeld` after the lease was released
    /// * `ResourceUnavailable` if loading fails; the context is then left
    ///   without overlay. If unloading fails the pipeline is discarded and
    ///   rebuilt on the next acquire.
    pub fn ensure_overlay(&mut self, wanted: Option<&OverlaySpec>) -> Result<()> {
        let program_id = self.program_id.clone();
        let engine = Arc::clone(&self.engine);
        let counters = Arc::clone(&self.counters);
        let loaded = self.loaded()?;
        if loaded.overlay.as_ref() == wanted {
            return Ok(());
        }

        if let Some(current) = loaded.overlay.take() {
            if let Err(err) = engine.unload_overlay(&mut loaded.pipeline) {
                tracing::error!(
                    target: "pipeline_cache",
                    program_id = %program_id,
                    overlay = %current.id,
                    error = %err,
                    "overlay unload failed, discarding pipeline"
                );
                if let Some(slot) = self.guard.as_deref_mut() {
                    *slot = None;
                }
                return Err(GenerationError::resource_unavailable(program_id.as_str(), err.to_string()));
            }
            tracing::debug!(target: "pipeline_cache", program_id = %program_id, overlay = %current.id, "overlay unloaded");
        }

        if let Some(overlay) = wanted {
            engine
                .load_overlay(&mut loaded.pipeline, overlay)
                .map_err(|err| {
                    tracing::warn!(
                        target: "pipeline_cache",
                        program_id = %program_id,
                        overlay = %overlay.id,
                        error = %err,
                        "overlay load failed"
                    );
                    GenerationError::resource_unavailable(program_id.as_str(), err.to_string())
                })?;
            loaded.overlay = Some(overlay.clone());
            tracing::debug!(target: "pipeline_cache", program_id = %program_id, overlay = %overlay.id, "overlay loaded");
        }
        counters.overlay_swaps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Returns the context to the cache. Idempotent.
    pub fn release(&mut self) {
        if self.guard.take().is_some() {
            tracing::debug!(target: "pipeline_cache", program_id = %self.program_id, "released");
        }
    }
}

impl<E: Engine> Drop for PipelineLease<E> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<E: Engine> fmt::Debug for PipelineLease<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineLease")
            .field("program_id", &self.program_id)
            .field("held", &self.is_held())
            .field("overlay", &self.overlay().map(|o| o.id.as_str()))
            .finish()
    }
}

#[cfg(test)]
#[path = "cache_test.rs"]
mod tests;
