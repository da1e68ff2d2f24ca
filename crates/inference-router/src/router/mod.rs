//! Router - owns the loaded backends
//!
//! The router decides which models may be resident at once and in what
//! order they leave:
//! - per model type capacity, evicting the least recently used instance
//! - a single NPU holder, evicted ahead of any capacity decision
//! - one load at a time, with the state lock released while the engine
//!   starts
//! - eviction waits for in-flight requests on the victim
//!
//! Dispatch (see `dispatch.rs`) looks models up by the request's `model`
//! field and returns OpenAI-style error envelopes instead of failing.

mod dispatch;
mod instance;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::backend::{BackendError, BackendInfo, BackendRegistry, LoadContext, LoadFailureKind};
use crate::config::RouterConfig;
use crate::error::RouterError;
use crate::ports::PortAllocator;
use crate::process::ProcessSpawner;
use crate::telemetry::Telemetry;
use crate::types::{
    DeviceMask, LoadRequest, ModelDescriptor, ModelOverrides, ModelType, UpgradePolicy,
};

use instance::BackendInstance;
pub use instance::LoadedModel;

#[derive(Default)]
struct RouterState {
    /// Loaded instances in load order
    instances: Vec<Arc<BackendInstance>>,
    /// A load holds the load right
    loading: bool,
}

/// Releases the load right on every exit path, including cancellation
struct LoadGuard<'a> {
    router: &'a Router,
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        self.router.state.lock().loading = false;
        self.router.load_finished.notify_waiters();
    }
}

/// Multiplexes inference requests over locally spawned engine servers
pub struct Router {
    config: Arc<RouterConfig>,
    registry: BackendRegistry,
    context: LoadContext,
    state: Mutex<RouterState>,
    load_finished: Notify,
}

impl Router {
    pub fn new(
        config: RouterConfig,
        registry: BackendRegistry,
        spawner: Arc<dyn ProcessSpawner>,
    ) -> Result<Self, RouterError> {
        config
            .validate()
            .map_err(|e| RouterError::Config(e.to_string()))?;
        let config = Arc::new(config);
        let context = LoadContext {
            spawner,
            ports: Arc::new(PortAllocator::new(config.port_base, config.port_range)),
            config: config.clone(),
            http: reqwest::Client::new(),
        };

        Ok(Self {
            config,
            registry,
            context,
            state: Mutex::new(RouterState::default()),
            load_finished: Notify::new(),
        })
    }

    /// Router over every compiled-in engine, spawning real processes
    #[cfg(feature = "std-process")]
    pub fn with_config(config: RouterConfig) -> Result<Self, RouterError> {
        Self::new(
            config,
            BackendRegistry::new(),
            Arc::new(crate::process::StdProcessSpawner::new()),
        )
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    // ─── LOADING ────────────────────────────────────────────────────

    /// Load `name`, evicting whatever admission requires.
    ///
    /// Loading an already loaded model only refreshes its last access.
    /// Failures other than a missing file or an invalidated model unload
    /// every model and retry once.
    pub async fn load_model(
        &self,
        name: &str,
        descriptor: &ModelDescriptor,
        upgrade_policy: UpgradePolicy,
        overrides: &ModelOverrides,
    ) -> Result<(), RouterError> {
        let _load = self.acquire_load_right().await;

        if let Some(instance) = self.find(name) {
            log::debug!("{} already loaded", name);
            instance.touch();
            return Ok(());
        }

        if !self.registry.supports(descriptor.recipe) {
            return Err(RouterError::Config(format!(
                "no backend available for recipe {}",
                descriptor.recipe
            )));
        }

        let model_type = descriptor.effective_type();
        let device = descriptor.effective_device(overrides);
        let request = LoadRequest::new(
            name,
            descriptor,
            upgrade_policy,
            overrides,
            self.config.default_context_size,
        );

        self.admit(model_type, device).await;

        let result = match self.start_instance(&request, model_type, device).await {
            Ok(instance) => Ok(instance),
            Err(e) => match e.load_failure_kind() {
                LoadFailureKind::NotFound | LoadFailureKind::Invalidated => {
                    log::warn!("Failed to load {}: {}", name, e);
                    Err(e)
                }
                LoadFailureKind::Recoverable => {
                    log::warn!(
                        "Failed to load {}: {}. Unloading all models and retrying",
                        name,
                        e
                    );
                    self.retire_all("freeing resources for retry").await;
                    self.start_instance(&request, model_type, device).await
                }
            },
        };

        let instance = result.map_err(|e| {
            log::error!("Giving up on {}: {}", name, e);
            RouterError::from(e)
        })?;
        log::info!(
            "Loaded {} ({}, {}, {})",
            name,
            instance.recipe,
            model_type,
            instance.device
        );
        self.state.lock().instances.push(instance);
        Ok(())
    }

    /// Register `name` as served by an engine already running at `url`.
    ///
    /// The attached model is admitted and evicted like a loaded one, but
    /// unloading it leaves the engine running. Only llama.cpp supports it.
    pub async fn attach_model(
        &self,
        name: &str,
        descriptor: &ModelDescriptor,
        url: &str,
    ) -> Result<(), RouterError> {
        let _load = self.acquire_load_right().await;

        if let Some(instance) = self.find(name) {
            log::debug!("{} already loaded", name);
            instance.touch();
            return Ok(());
        }

        let mut backend = self.registry.create(descriptor.recipe)?;
        let model_type = descriptor.effective_type();
        let device = descriptor.effective_device(&ModelOverrides::default());

        // Attaching starts nothing, so nothing is evicted for a server that
        // cannot be reached
        backend.connect_external(url, &self.context).await?;
        self.admit(model_type, device).await;

        log::info!("Attached {} at {} ({})", name, url, model_type);
        self.state.lock().instances.push(Arc::new(BackendInstance::new(
            name,
            &descriptor.checkpoint,
            model_type,
            device,
            backend,
        )));
        Ok(())
    }

    async fn acquire_load_right(&self) -> LoadGuard<'_> {
        loop {
            let notified = self.load_finished.notified();
            {
                let mut state = self.state.lock();
                if !state.loading {
                    state.loading = true;
                    return LoadGuard { router: self };
                }
            }
            log::debug!("Waiting for another load to finish");
            notified.await;
        }
    }

    /// Evict the NPU holder when `device` needs the NPU, then make room
    /// within the type's capacity
    async fn admit(&self, model_type: ModelType, device: DeviceMask) {
        if device.has_npu() {
            if let Some(holder) = self.detach_first(|i| i.device.has_npu()) {
                self.retire(holder, "NPU is needed by another model").await;
            }
        }
        self.make_room(model_type).await;
    }

    /// Evict LRU instances of `model_type` until one more fits
    async fn make_room(&self, model_type: ModelType) {
        let limit = self.config.max_loaded_models.get(model_type);
        loop {
            let victim = {
                let mut state = self.state.lock();
                let count = state
                    .instances
                    .iter()
                    .filter(|i| i.model_type == model_type)
                    .count();
                if count < limit {
                    return;
                }
                // min_by_key keeps the first of equal keys: ties go to load order
                let index = state
                    .instances
                    .iter()
                    .enumerate()
                    .filter(|(_, i)| i.model_type == model_type)
                    .min_by_key(|(_, i)| i.last_access())
                    .map(|(index, _)| index);
                match index {
                    Some(index) => state.instances.remove(index),
                    None => return,
                }
            };
            self.retire(victim, "capacity reached").await;
        }
    }

    async fn start_instance(
        &self,
        request: &LoadRequest,
        model_type: ModelType,
        device: DeviceMask,
    ) -> Result<Arc<BackendInstance>, BackendError> {
        let mut backend = self.registry.create(request.descriptor.recipe)?;
        log::info!(
            "Starting {} for {} on {}",
            backend.name(),
            request.name,
            device
        );
        if let Err(e) = backend.load(request, &self.context).await {
            backend.unload();
            return Err(e);
        }
        Ok(Arc::new(BackendInstance::new(
            &request.name,
            &request.descriptor.checkpoint,
            model_type,
            device,
            backend,
        )))
    }

    // ─── UNLOADING ──────────────────────────────────────────────────

    /// Unload one model, or every model when `name` is empty
    pub async fn unload_model(&self, name: &str) -> Result<(), RouterError> {
        if name.is_empty() {
            self.retire_all("unload all requested").await;
            return Ok(());
        }
        let instance = self
            .detach_first(|i| i.name == name)
            .ok_or_else(|| RouterError::ModelNotLoaded(name.to_string()))?;
        self.retire(instance, "unload requested").await;
        Ok(())
    }

    /// Unload everything
    pub async fn shutdown(&self) {
        log::info!("Shutting down router");
        self.retire_all("shutdown").await;
    }

    /// Remove instances whose engine process has died
    pub async fn check_health(&self) -> Vec<String> {
        let dead: Vec<Arc<BackendInstance>> = {
            let mut state = self.state.lock();
            let (dead, alive): (Vec<_>, Vec<_>) = std::mem::take(&mut state.instances)
                .into_iter()
                .partition(|i| !i.backend.is_alive());
            state.instances = alive;
            dead
        };

        let mut names = Vec::with_capacity(dead.len());
        for instance in dead {
            names.push(instance.name.clone());
            self.retire(instance, "backend process exited").await;
        }
        names
    }

    fn detach_first<P>(&self, predicate: P) -> Option<Arc<BackendInstance>>
    where
        P: Fn(&BackendInstance) -> bool,
    {
        let mut state = self.state.lock();
        let index = state.instances.iter().position(|i| predicate(i))?;
        Some(state.instances.remove(index))
    }

    fn detach(&self, instance: &Arc<BackendInstance>) -> bool {
        let mut state = self.state.lock();
        match state
            .instances
            .iter()
            .position(|i| Arc::ptr_eq(i, instance))
        {
            Some(index) => {
                state.instances.remove(index);
                true
            }
            None => false,
        }
    }

    /// Stop a detached instance once its in-flight requests finish
    async fn retire(&self, instance: Arc<BackendInstance>, reason: &str) {
        if instance.is_busy() {
            log::info!("Waiting for requests on {} before unloading", instance.name);
        }
        instance.wait_idle().await;
        log::info!("Unloading {} ({})", instance.name, reason);
        instance.backend.unload();
    }

    async fn retire_all(&self, reason: &str) {
        let instances = std::mem::take(&mut self.state.lock().instances);
        for instance in instances {
            self.retire(instance, reason).await;
        }
    }

    // ─── STATUS ─────────────────────────────────────────────────────

    fn find(&self, name: &str) -> Option<Arc<BackendInstance>> {
        self.state
            .lock()
            .instances
            .iter()
            .find(|i| i.name == name)
            .cloned()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    pub fn is_loading(&self) -> bool {
        self.state.lock().loading
    }

    /// Loaded models in load order
    pub fn loaded_models(&self) -> Vec<LoadedModel> {
        self.state
            .lock()
            .instances
            .iter()
            .map(|i| i.info())
            .collect()
    }

    fn most_recent(&self) -> Option<Arc<BackendInstance>> {
        self.state
            .lock()
            .instances
            .iter()
            .max_by_key(|i| i.last_access())
            .cloned()
    }

    /// Name of the most recently used model
    pub fn most_recent_model(&self) -> Option<String> {
        self.most_recent().map(|i| i.name.clone())
    }

    /// Telemetry of the most recently used model
    pub fn stats(&self) -> Option<Telemetry> {
        self.most_recent().map(|i| i.telemetry())
    }

    /// Registered engines and whether their executables can be found
    pub fn backends(&self) -> Vec<BackendInfo> {
        self.registry.list(&self.config)
    }
}
