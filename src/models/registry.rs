//! Model registry: descriptor catalog plus a bounded, single-flight model cache

use crate::config::RegistryConfig;
use crate::error::{DiagnosticError, Result};
use crate::models::descriptor::ModelDescriptor;
use crate::models::loader::{FileWeightsLoader, LoadedModel, WeightsLoader};
use crate::types::request::TaskType;
use serde::Serialize;
use std::collections::HashMap;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Result of an explicit eviction request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionOutcome {
    /// The model was idle and has been dropped from the cache
    Evicted,
    /// The model is leased; it leaves the cache when the last lease drops
    Deferred,
    /// Nothing cached under this id
    NotResident,
}

/// Registry counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub registered: usize,
    pub resident: usize,
    pub hits: u64,
    pub misses: u64,
    pub loads_started: u64,
    pub loads_failed: u64,
    pub load_timeouts: u64,
    pub evictions: u64,
}

impl RegistryStats {
    /// Fraction of lookups served from the cache
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads_started: AtomicU64,
    loads_failed: AtomicU64,
    load_timeouts: AtomicU64,
    evictions: AtomicU64,
}

struct ResidentEntry {
    model: Arc<LoadedModel>,
    last_used: u64,
    leases: usize,
    evict_on_release: bool,
}

type LoadOutcome = Result<Arc<LoadedModel>>;

/// Rendezvous for every caller waiting on one in-flight load
struct LoadSlot {
    outcome: Mutex<Option<LoadOutcome>>,
    ready: Condvar,
}

impl LoadSlot {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn complete(&self, outcome: LoadOutcome) {
        let mut slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(outcome);
        self.ready.notify_all();
    }

    /// `None` when the timeout expired first
    fn wait(&self, timeout: Option<Duration>) -> Option<LoadOutcome> {
        let guard = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        let guard = match timeout {
            Some(timeout) => {
                self.ready
                    .wait_timeout_while(guard, timeout, |outcome| outcome.is_none())
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => self
                .ready
                .wait_while(guard, |outcome| outcome.is_none())
                .unwrap_or_else(PoisonError::into_inner),
        };
        (*guard).clone()
    }
}

#[derive(Default)]
struct State {
    descriptors: HashMap<String, Arc<ModelDescriptor>>,
    resident: HashMap<String, ResidentEntry>,
    in_flight: HashMap<String, Arc<LoadSlot>>,
    clock: u64,
}

impl State {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Lease a resident model, bumping its recency
    fn lease(&mut self, id: &str) -> Option<Arc<LoadedModel>> {
        let now = self.tick();
        let entry = self.resident.get_mut(id)?;
        entry.last_used = now;
        entry.leases += 1;
        Some(entry.model.clone())
    }

    /// Lease the exact model a load produced, if it is still the cached one
    fn lease_loaded(&mut self, model: &Arc<LoadedModel>) -> bool {
        let now = self.tick();
        match self.resident.get_mut(model.id()) {
            Some(entry) if Arc::ptr_eq(&entry.model, model) => {
                entry.last_used = now;
                entry.leases += 1;
                true
            }
            _ => false,
        }
    }
}

struct Shared {
    state: Mutex<State>,
    counters: Counters,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        // Every mutation completes under one guard, so a poisoned lock still
        // holds a consistent state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Evict least-recently-used idle models until one more fits alongside
    /// `reserved` loads that have yet to land.
    fn make_room(&self, state: &mut State, capacity: usize, reserved: usize) {
        while !state.resident.is_empty() && state.resident.len() + reserved >= capacity {
            let victim = state
                .resident
                .iter()
                .filter(|(_, entry)| entry.leases == 0)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(id, _)| id.clone());

            match victim {
                Some(id) => {
                    state.resident.remove(&id);
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    info!(model = %id, "Evicted least-recently-used model");
                }
                None => {
                    warn!(
                        resident = state.resident.len(),
                        capacity = capacity,
                        "All resident models are in use, exceeding cache capacity"
                    );
                    break;
                }
            }
        }
    }

    fn release(&self, model: &Arc<LoadedModel>) {
        let id = model.id();
        let mut state = self.lock_state();
        let remove = match state.resident.get_mut(id) {
            Some(entry) if Arc::ptr_eq(&entry.model, model) => {
                entry.leases = entry.leases.saturating_sub(1);
                entry.leases == 0 && entry.evict_on_release
            }
            _ => false,
        };
        if remove {
            state.resident.remove(id);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            info!(model = %id, "Deferred eviction completed");
        }
    }
}

/// Shared handle to a loaded model.
///
/// A leased model is never evicted; dropping the lease releases it.
pub struct ModelLease {
    model: Arc<LoadedModel>,
    shared: Arc<Shared>,
    counted: bool,
}

impl ModelLease {
    pub fn model(&self) -> &Arc<LoadedModel> {
        &self.model
    }
}

impl Deref for ModelLease {
    type Target = LoadedModel;

    fn deref(&self) -> &LoadedModel {
        &self.model
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        if self.counted {
            self.shared.release(&self.model);
        }
    }
}

impl std::fmt::Debug for ModelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLease")
            .field("model", &self.model)
            .field("counted", &self.counted)
            .finish()
    }
}

/// Catalog of model descriptors and owner of every loaded model
pub struct ModelRegistry {
    shared: Arc<Shared>,
    loader: Arc<dyn WeightsLoader>,
    max_resident: usize,
    load_timeout: Option<Duration>,
}

impl ModelRegistry {
    /// Create a registry that loads weights through `loader`
    pub fn new(config: &RegistryConfig, loader: Arc<dyn WeightsLoader>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                counters: Counters::default(),
            }),
            loader,
            max_resident: config.max_resident_models.max(1),
            load_timeout: config.load_timeout(),
        }
    }

    /// Create a registry backed by the filesystem loader
    pub fn from_config(config: &RegistryConfig) -> anyhow::Result<Self> {
        let mut loader = FileWeightsLoader::with_threads(config.onnx_threads)?;
        if let Some(dir) = &config.models_dir {
            loader = loader.with_base_dir(dir);
        }
        Ok(Self::new(config, Arc::new(loader)))
    }

    /// Add a descriptor. Weights are not touched until first use.
    pub fn register(&self, descriptor: ModelDescriptor) -> Result<()> {
        descriptor.validate()?;

        let mut state = self.shared.lock_state();
        if state.descriptors.contains_key(&descriptor.id) {
            return Err(DiagnosticError::DuplicateModel(descriptor.id));
        }

        info!(
            model = %descriptor.id,
            task = %descriptor.task_type,
            version = descriptor.version,
            labels = descriptor.label_count(),
            "Registered model"
        );
        state
            .descriptors
            .insert(descriptor.id.clone(), Arc::new(descriptor));
        Ok(())
    }

    pub fn descriptor(&self, id: &str) -> Option<Arc<ModelDescriptor>> {
        self.shared.lock_state().descriptors.get(id).cloned()
    }

    /// All descriptors, sorted by id
    pub fn descriptors(&self) -> Vec<Arc<ModelDescriptor>> {
        let mut all: Vec<_> = self.shared.lock_state().descriptors.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Highest-version descriptor registered for `task`, ties broken by id
    pub fn latest_for_task(&self, task: TaskType) -> Option<Arc<ModelDescriptor>> {
        self.shared
            .lock_state()
            .descriptors
            .values()
            .filter(|desc| desc.task_type == task)
            .max_by(|a, b| a.version.cmp(&b.version).then_with(|| b.id.cmp(&a.id)))
            .cloned()
    }

    pub fn is_resident(&self, id: &str) -> bool {
        self.shared.lock_state().resident.contains_key(id)
    }

    /// Ids of cached models, sorted
    pub fn resident_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.lock_state().resident.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn capacity(&self) -> usize {
        self.max_resident
    }

    /// Return a ready model, loading it at most once per id.
    ///
    /// Concurrent callers for an id that is not cached all wait on the same
    /// load. A caller that times out gets `ModelLoadTimeout`; the load keeps
    /// running and still populates the cache.
    pub fn get_or_load(&self, id: &str) -> Result<ModelLease> {
        let slot = {
            let mut state = self.shared.lock_state();
            if let Some(model) = state.lease(id) {
                self.shared.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(self.lease(model, true));
            }

            let descriptor = state
                .descriptors
                .get(id)
                .cloned()
                .ok_or_else(|| DiagnosticError::UnknownModel(id.to_string()))?;
            self.shared.counters.misses.fetch_add(1, Ordering::Relaxed);

            match state.in_flight.get(id) {
                Some(slot) => {
                    debug!(model = %id, "Joining in-flight load");
                    slot.clone()
                }
                None => {
                    // Free the slot before the new weights are read into memory
                    let reserved = state.in_flight.len();
                    self.shared.make_room(&mut state, self.max_resident, reserved);
                    let slot = Arc::new(LoadSlot::new());
                    self.spawn_load(descriptor, slot.clone())?;
                    state.in_flight.insert(id.to_string(), slot.clone());
                    slot
                }
            }
        };

        let model = match slot.wait(self.load_timeout) {
            Some(outcome) => outcome?,
            None => {
                self.shared.counters.load_timeouts.fetch_add(1, Ordering::Relaxed);
                let timeout_ms = self.load_timeout.map(|t| t.as_millis() as u64).unwrap_or(0);
                warn!(model = %id, timeout_ms = timeout_ms, "Model load timed out");
                return Err(DiagnosticError::ModelLoadTimeout {
                    id: id.to_string(),
                    timeout_ms,
                });
            }
        };

        let counted = self.shared.lock_state().lease_loaded(&model);
        Ok(self.lease(model, counted))
    }

    /// Drop a cached model. A leased model is evicted once released.
    pub fn evict(&self, id: &str) -> EvictionOutcome {
        let mut state = self.shared.lock_state();
        let outcome = match state.resident.get_mut(id) {
            None => EvictionOutcome::NotResident,
            Some(entry) if entry.leases > 0 => {
                entry.evict_on_release = true;
                EvictionOutcome::Deferred
            }
            Some(_) => {
                state.resident.remove(id);
                self.shared.counters.evictions.fetch_add(1, Ordering::Relaxed);
                EvictionOutcome::Evicted
            }
        };
        debug!(model = %id, outcome = ?outcome, "Eviction requested");
        outcome
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.shared.lock_state();
        let c = &self.shared.counters;
        RegistryStats {
            registered: state.descriptors.len(),
            resident: state.resident.len(),
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            loads_started: c.loads_started.load(Ordering::Relaxed),
            loads_failed: c.loads_failed.load(Ordering::Relaxed),
            load_timeouts: c.load_timeouts.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
        }
    }

    fn lease(&self, model: Arc<LoadedModel>, counted: bool) -> ModelLease {
        ModelLease {
            model,
            shared: self.shared.clone(),
            counted,
        }
    }

    /// Run the load on its own thread so waiters can give up on a timeout
    /// without abandoning the load.
    fn spawn_load(&self, descriptor: Arc<ModelDescriptor>, slot: Arc<LoadSlot>) -> Result<()> {
        let shared = self.shared.clone();
        let loader = self.loader.clone();
        let capacity = self.max_resident;
        let id = descriptor.id.clone();
        let spawn_id = id.clone();

        shared.counters.loads_started.fetch_add(1, Ordering::Relaxed);
        thread::Builder::new()
            .name(format!("load-{id}"))
            .spawn(move || {
                let started = Instant::now();
                let outcome = match panic::catch_unwind(AssertUnwindSafe(|| loader.load(&descriptor))) {
                    Ok(Ok(backend)) => Ok(Arc::new(LoadedModel::new(descriptor.clone(), backend))),
                    Ok(Err(e)) => Err(DiagnosticError::model_load(&id, format!("{e:#}"))),
                    Err(_) => Err(DiagnosticError::model_load(&id, "loader panicked")),
                };

                {
                    let mut state = shared.lock_state();
                    state.in_flight.remove(&id);
                    match &outcome {
                        Ok(model) => {
                            // Cache may have refilled while the load ran
                            shared.make_room(&mut state, capacity, 0);
                            let now = state.tick();
                            state.resident.insert(
                                id.clone(),
                                ResidentEntry {
                                    model: model.clone(),
                                    last_used: now,
                                    leases: 0,
                                    evict_on_release: false,
                                },
                            );
                            info!(
                                model = %id,
                                backend = model.backend().backend_type(),
                                elapsed_ms = started.elapsed().as_millis() as u64,
                                "Model loaded"
                            );
                        }
                        Err(e) => {
                            shared.counters.loads_failed.fetch_add(1, Ordering::Relaxed);
                            warn!(model = %id, error = %e, "Model load failed");
                        }
                    }
                }

                slot.complete(outcome);
            })
            .map(|_| ())
            .map_err(|e| {
                self.shared.counters.loads_failed.fetch_add(1, Ordering::Relaxed);
                DiagnosticError::model_load(&spawn_id, e)
            })
    }
}
