//! One loaded model and its busy tracking

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use crate::backend::InferenceBackend;
use crate::telemetry::Telemetry;
use crate::types::{DeviceMask, ModelType, Recipe};

#[derive(Debug, Clone, Copy)]
struct Access {
    /// Ordering key for LRU decisions
    at: Instant,
    /// Same moment on the wall clock, for reporting
    wall: DateTime<Utc>,
}

impl Access {
    fn now() -> Self {
        Self {
            at: Instant::now(),
            wall: Utc::now(),
        }
    }
}

/// A loaded model owned by the router
pub(crate) struct BackendInstance {
    pub name: String,
    pub checkpoint: String,
    pub recipe: Recipe,
    pub model_type: ModelType,
    pub device: DeviceMask,
    pub backend: Box<dyn InferenceBackend>,
    in_flight: AtomicUsize,
    idle: Notify,
    access: Mutex<Access>,
    telemetry: Mutex<Telemetry>,
}

impl BackendInstance {
    pub fn new(
        name: &str,
        checkpoint: &str,
        model_type: ModelType,
        device: DeviceMask,
        backend: Box<dyn InferenceBackend>,
    ) -> Self {
        Self {
            name: name.to_string(),
            checkpoint: checkpoint.to_string(),
            recipe: backend.recipe(),
            model_type,
            device,
            backend,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            access: Mutex::new(Access::now()),
            telemetry: Mutex::new(Telemetry::default()),
        }
    }

    pub fn touch(&self) {
        *self.access.lock() = Access::now();
    }

    pub fn last_access(&self) -> Instant {
        self.access.lock().at
    }

    pub fn last_access_wall(&self) -> DateTime<Utc> {
        self.access.lock().wall
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    pub fn telemetry(&self) -> Telemetry {
        self.telemetry.lock().clone()
    }

    pub fn record_telemetry(&self, telemetry: Telemetry) {
        *self.telemetry.lock() = telemetry;
    }

    /// Resolve once no request is running on this instance
    pub async fn wait_idle(&self) {
        loop {
            // Registered before the check so a release in between is not lost
            let notified = self.idle.notified();
            if !self.is_busy() {
                return;
            }
            notified.await;
        }
    }

    pub fn info(&self) -> LoadedModel {
        LoadedModel {
            name: self.name.clone(),
            checkpoint: self.checkpoint.clone(),
            recipe: self.recipe,
            model_type: self.model_type,
            device: self.device,
            last_access: self.last_access_wall(),
            base_url: self.backend.base_url(),
            telemetry: self.telemetry(),
        }
    }
}

/// Marks an instance busy for as long as it lives
pub(crate) struct BusyGuard {
    instance: Arc<BackendInstance>,
}

impl BusyGuard {
    /// Must be called with the router state locked, so eviction cannot
    /// detach the instance between lookup and marking
    pub fn new(instance: Arc<BackendInstance>) -> Self {
        instance.in_flight.fetch_add(1, Ordering::SeqCst);
        Self { instance }
    }

    pub fn instance(&self) -> &Arc<BackendInstance> {
        &self.instance
    }

    pub fn backend(&self) -> &dyn InferenceBackend {
        self.instance.backend.as_ref()
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if self.instance.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.instance.idle.notify_waiters();
        }
    }
}

/// Snapshot of a loaded model for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct LoadedModel {
    pub name: String,
    pub checkpoint: String,
    pub recipe: Recipe,
    #[serde(rename = "type")]
    pub model_type: ModelType,
    pub device: DeviceMask,
    pub last_access: DateTime<Utc>,
    pub base_url: Option<String>,
    pub telemetry: Telemetry,
}
