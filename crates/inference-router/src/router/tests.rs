//! Router behaviour against scripted in-memory backends

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::Router;
use crate::backend::{
    BackendCapabilities, BackendError, BackendFactory, BackendInfo, BackendRegistry, ByteStream,
    EmbeddingsCapability, HttpForwarder, InferenceBackend, LoadContext, StreamEndpoint,
};
use crate::config::RouterConfig;
use crate::error::RouterError;
use crate::process::{ProcessCommand, ProcessError, ProcessHandle, ProcessSpawner};
use crate::types::{
    DeviceMask, Engine, LoadRequest, ModelDescriptor, ModelOverrides, ModelType, Recipe,
    UpgradePolicy,
};

#[derive(Debug, Clone, Copy)]
enum Failure {
    NotFound,
    Invalidated,
    Crash,
}

impl Failure {
    fn into_error(self, name: &str) -> BackendError {
        match self {
            Failure::NotFound => BackendError::NotFound(format!("{} missing", name)),
            Failure::Invalidated => BackendError::ModelInvalidated(format!("{} stale", name)),
            Failure::Crash => BackendError::StartupFailed {
                message: format!("{} exited", name),
                exit_code: Some(1),
            },
        }
    }
}

/// Shared between the test, the factory and every backend it creates
#[derive(Default)]
struct Script {
    events: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, VecDeque<Failure>>>,
    load_delay: Mutex<Duration>,
    request_delay: Mutex<Duration>,
    active_loads: AtomicUsize,
    max_active_loads: AtomicUsize,
    /// Liveness flag per model name; missing means alive
    alive: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl Script {
    fn record(&self, event: String) {
        self.events.lock().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn position(&self, event: &str) -> usize {
        self.events()
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("no event {event} in {:?}", self.events()))
    }

    fn fail_next(&self, name: &str, failure: Failure) {
        self.failures
            .lock()
            .entry(name.to_string())
            .or_default()
            .push_back(failure);
    }

    fn kill(&self, name: &str) {
        self.alive
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(true)))
            .store(false, Ordering::SeqCst);
    }
}

struct ScriptedBackend {
    recipe: Recipe,
    script: Arc<Script>,
    name: String,
    ready: AtomicBool,
}

impl ScriptedBackend {
    fn alive(&self) -> bool {
        self.script
            .alive
            .lock()
            .get(&self.name)
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(true)
    }

    async fn serve(&self, request: &Value) -> Result<Value, BackendError> {
        self.script.record(format!("request-start:{}", self.name));
        let delay = *self.script.request_delay.lock();
        tokio::time::sleep(delay).await;
        self.script.record(format!("request-end:{}", self.name));

        if !self.alive() {
            return Err(BackendError::Network("connection refused".to_string()));
        }
        Ok(json!({
            "model": request["model"],
            "choices": [{"message": {"role": "assistant", "content": "ok"}}],
            "usage": {"prompt_tokens": 7, "completion_tokens": 3}
        }))
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn recipe(&self) -> Recipe {
        self.recipe
    }

    async fn load(
        &mut self,
        request: &LoadRequest,
        _context: &LoadContext,
    ) -> Result<(), BackendError> {
        self.name = request.name.clone();
        self.script.record(format!("load:{}", self.name));

        let active = self.script.active_loads.fetch_add(1, Ordering::SeqCst) + 1;
        self.script
            .max_active_loads
            .fetch_max(active, Ordering::SeqCst);
        let delay = *self.script.load_delay.lock();
        tokio::time::sleep(delay).await;
        self.script.active_loads.fetch_sub(1, Ordering::SeqCst);

        let failure = self
            .script
            .failures
            .lock()
            .get_mut(&self.name)
            .and_then(|queue| queue.pop_front());
        if let Some(failure) = failure {
            self.script.record(format!("failed:{}", self.name));
            return Err(failure.into_error(&self.name));
        }
        self.ready.store(true, Ordering::SeqCst);
        self.script.record(format!("loaded:{}", self.name));
        Ok(())
    }

    fn unload(&self) {
        if self.ready.swap(false, Ordering::SeqCst) {
            self.script.record(format!("unload:{}", self.name));
        }
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn is_alive(&self) -> bool {
        self.alive()
    }

    fn base_url(&self) -> Option<String> {
        Some(format!("http://127.0.0.1/{}", self.name))
    }

    fn http(&self) -> Result<&HttpForwarder, BackendError> {
        Err(BackendError::NotReady)
    }

    async fn chat_completion(&self, request: Value) -> Result<Value, BackendError> {
        self.serve(&request).await
    }

    async fn completion(&self, request: Value) -> Result<Value, BackendError> {
        self.serve(&request).await
    }

    async fn open_stream(
        &self,
        _endpoint: StreamEndpoint,
        _request: Value,
    ) -> Result<ByteStream, BackendError> {
        if !self.alive() {
            return Err(BackendError::Network("connection refused".to_string()));
        }
        let chunks: Vec<Result<Vec<u8>, BackendError>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"o\"}}]}\n\n".to_vec()),
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"k\"}}],".to_vec()),
            Ok(b"\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":2}}\n\n".to_vec()),
            Ok(b"data: [DONE]\n\n".to_vec()),
        ];
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }

    fn as_embeddings(&self) -> Option<&dyn EmbeddingsCapability> {
        (self.recipe == Recipe::LlamaCpp).then_some(self as &dyn EmbeddingsCapability)
    }
}

#[async_trait]
impl EmbeddingsCapability for ScriptedBackend {
    async fn embeddings(&self, request: Value) -> Result<Value, BackendError> {
        Ok(json!({"model": request["model"], "data": [{"embedding": [0.1]}]}))
    }
}

struct ScriptedFactory {
    script: Arc<Script>,
}

impl BackendFactory for ScriptedFactory {
    fn create(&self, recipe: Recipe) -> Result<Box<dyn InferenceBackend>, BackendError> {
        Ok(Box::new(ScriptedBackend {
            recipe,
            script: self.script.clone(),
            name: String::new(),
            ready: AtomicBool::new(false),
        }))
    }

    fn info(&self, _config: &RouterConfig) -> BackendInfo {
        BackendInfo {
            name: "scripted".to_string(),
            description: "test backend".to_string(),
            capabilities: BackendCapabilities::default(),
            available: true,
            unavailable_reason: None,
        }
    }
}

/// Never called: scripted backends do not spawn processes
struct NoSpawner;

#[async_trait]
impl ProcessSpawner for NoSpawner {
    async fn spawn(&self, command: &ProcessCommand) -> Result<Box<dyn ProcessHandle>, ProcessError> {
        Err(ProcessError::NotFound(command.program.clone()))
    }
}

fn router_with(config: RouterConfig) -> (Arc<Router>, Arc<Script>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let script = Arc::new(Script::default());
    let mut registry = BackendRegistry::empty();
    for engine in [Engine::LlamaCpp, Engine::Oga, Engine::Flm, Engine::Whisper] {
        registry.register(
            engine,
            Box::new(ScriptedFactory {
                script: script.clone(),
            }),
        );
    }
    let router = Router::new(config, registry, Arc::new(NoSpawner)).unwrap();
    (Arc::new(router), script)
}

fn router() -> (Arc<Router>, Arc<Script>) {
    router_with(RouterConfig::default())
}

fn descriptor(name: &str, recipe: Recipe, model_type: ModelType) -> ModelDescriptor {
    ModelDescriptor {
        name: name.to_string(),
        checkpoint: format!("org/{}", name),
        recipe,
        resolved_path: PathBuf::from(format!("/models/{}", name)),
        model_type,
        device: DeviceMask::NONE,
        labels: Vec::new(),
        context_size: None,
        engine_backend: None,
        engine_args: None,
    }
}

async fn load(router: &Router, name: &str, recipe: Recipe, model_type: ModelType) {
    router
        .load_model(
            name,
            &descriptor(name, recipe, model_type),
            UpgradePolicy::Upgrade,
            &ModelOverrides::default(),
        )
        .await
        .unwrap();
}

fn names(router: &Router) -> Vec<String> {
    router.loaded_models().into_iter().map(|m| m.name).collect()
}

async fn tick() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

#[tokio::test]
async fn test_capacity_evicts_previous_model() {
    let (router, script) = router();
    load(&router, "A", Recipe::LlamaCpp, ModelType::Llm).await;
    load(&router, "B", Recipe::LlamaCpp, ModelType::Llm).await;

    assert_eq!(names(&router), vec!["B"]);
    assert!(script.position("unload:A") < script.position("load:B"));
}

#[tokio::test]
async fn test_capacity_evicts_least_recently_used() {
    let mut config = RouterConfig::default();
    config.max_loaded_models.set(ModelType::Llm, 2);
    let (router, script) = router_with(config);

    load(&router, "A", Recipe::LlamaCpp, ModelType::Llm).await;
    tick().await;
    load(&router, "B", Recipe::LlamaCpp, ModelType::Llm).await;
    tick().await;
    router.chat_completion(json!({"model": "A", "messages": []})).await;
    tick().await;
    load(&router, "C", Recipe::LlamaCpp, ModelType::Llm).await;

    assert_eq!(names(&router), vec!["A", "C"]);
    assert!(script.events().contains(&"unload:B".to_string()));
    assert!(!script.events().contains(&"unload:A".to_string()));
}

#[tokio::test]
async fn test_types_have_separate_capacity() {
    let (router, script) = router();
    load(&router, "chat", Recipe::LlamaCpp, ModelType::Llm).await;
    load(&router, "embed", Recipe::LlamaCpp, ModelType::Embedding).await;

    assert_eq!(names(&router), vec!["chat", "embed"]);
    assert!(!script.events().iter().any(|e| e.starts_with("unload:")));
}

#[tokio::test]
async fn test_npu_exclusivity_overrides_capacity() {
    let (router, script) = router();
    load(&router, "A", Recipe::OgaNpu, ModelType::Llm).await;
    load(&router, "B", Recipe::Flm, ModelType::Embedding).await;

    assert_eq!(names(&router), vec!["B"]);
    assert!(script.position("unload:A") < script.position("load:B"));
}

#[tokio::test]
async fn test_eviction_waits_for_busy_instance() {
    let (router, script) = router();
    *script.request_delay.lock() = Duration::from_millis(200);
    load(&router, "A", Recipe::LlamaCpp, ModelType::Llm).await;

    let in_flight = {
        let router = router.clone();
        tokio::spawn(async move { router.chat_completion(json!({"model": "A"})).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    load(&router, "B", Recipe::LlamaCpp, ModelType::Llm).await;
    let response = in_flight.await.unwrap();

    assert_eq!(response["model"], "A");
    assert!(script.position("request-end:A") < script.position("unload:A"));
    assert!(script.position("unload:A") < script.position("load:B"));
}

#[tokio::test]
async fn test_loads_are_serialized() {
    let (router, script) = router();
    *script.load_delay.lock() = Duration::from_millis(100);

    let first = {
        let router = router.clone();
        tokio::spawn(async move { load(&router, "A", Recipe::LlamaCpp, ModelType::Llm).await })
    };
    let second = {
        let router = router.clone();
        tokio::spawn(
            async move { load(&router, "E", Recipe::LlamaCpp, ModelType::Embedding).await },
        )
    };
    first.await.unwrap();
    second.await.unwrap();

    assert_eq!(script.max_active_loads.load(Ordering::SeqCst), 1);
    assert_eq!(router.loaded_models().len(), 2);
    assert!(!router.is_loading());
}

#[tokio::test]
async fn test_cancelled_load_releases_load_right() {
    let (router, script) = router();
    *script.load_delay.lock() = Duration::from_millis(500);

    let cancelled = tokio::time::timeout(
        Duration::from_millis(50),
        load(&router, "slow", Recipe::LlamaCpp, ModelType::Llm),
    )
    .await;
    assert!(cancelled.is_err());
    assert!(!router.is_loading());

    *script.load_delay.lock() = Duration::ZERO;
    tokio::time::timeout(
        Duration::from_secs(2),
        load(&router, "A", Recipe::LlamaCpp, ModelType::Llm),
    )
    .await
    .unwrap();
    assert_eq!(names(&router), vec!["A"]);
}

#[tokio::test]
async fn test_reloading_loaded_model_is_a_touch() {
    let (router, script) = router();
    load(&router, "A", Recipe::LlamaCpp, ModelType::Llm).await;
    load(&router, "A", Recipe::LlamaCpp, ModelType::Llm).await;

    let loads = script.events().iter().filter(|e| *e == "load:A").count();
    assert_eq!(loads, 1);
}

#[tokio::test]
async fn test_unknown_model_envelope() {
    let (router, _script) = router();
    load(&router, "A", Recipe::LlamaCpp, ModelType::Llm).await;

    let response = router
        .chat_completion(json!({"model": "nope", "messages": []}))
        .await;
    assert_eq!(response["error"]["type"], "model_not_loaded");
    assert_eq!(response["error"]["code"], 404);
}

#[tokio::test]
async fn test_missing_model_field_with_one_model_loaded() {
    let (router, script) = router();
    load(&router, "A", Recipe::LlamaCpp, ModelType::Llm).await;

    let response = router.chat_completion(json!({"messages": []})).await;
    assert_eq!(response["error"]["type"], "invalid_request_error");
    assert_eq!(response["error"]["code"], 400);
    assert!(!script.events().contains(&"request-start:A".to_string()));
}

#[tokio::test]
async fn test_dispatch_records_telemetry() {
    let (router, _script) = router();
    load(&router, "A", Recipe::LlamaCpp, ModelType::Llm).await;

    let response = router.completion(json!({"model": "A", "prompt": "hi"})).await;
    assert_eq!(response["model"], "A");

    let stats = router.stats().unwrap();
    assert_eq!(stats.input_tokens, Some(7));
    assert_eq!(stats.output_tokens, Some(3));
    assert_eq!(router.most_recent_model().as_deref(), Some("A"));
}

#[tokio::test]
async fn test_missing_capability_is_unsupported() {
    let (router, _script) = router();
    load(&router, "npu", Recipe::OgaNpu, ModelType::Llm).await;
    load(&router, "embed", Recipe::LlamaCpp, ModelType::Embedding).await;

    let response = router.embeddings(json!({"model": "npu", "input": "x"})).await;
    assert_eq!(response["error"]["type"], "unsupported_operation");
    assert_eq!(response["error"]["code"], 400);

    let response = router.embeddings(json!({"model": "embed", "input": "x"})).await;
    assert_eq!(response["data"][0]["embedding"][0], 0.1);

    let response = router
        .audio_transcriptions(json!({"model": "embed", "file_path": "/tmp/a.wav"}))
        .await;
    assert_eq!(response["error"]["type"], "unsupported_operation");
}

#[tokio::test]
async fn test_failed_load_evicts_all_and_retries_once() {
    let (router, script) = router();
    load(&router, "A", Recipe::LlamaCpp, ModelType::Llm).await;
    load(&router, "E", Recipe::LlamaCpp, ModelType::Embedding).await;
    script.fail_next("R", Failure::Crash);

    load(&router, "R", Recipe::LlamaCpp, ModelType::Reranking).await;

    assert_eq!(names(&router), vec!["R"]);
    let failed = script.position("failed:R");
    assert!(failed < script.position("unload:A"));
    assert!(failed < script.position("unload:E"));
    assert!(script.position("unload:E") < script.position("loaded:R"));
}

#[tokio::test]
async fn test_failed_retry_leaves_nothing_loaded() {
    let (router, script) = router();
    load(&router, "A", Recipe::LlamaCpp, ModelType::Llm).await;
    script.fail_next("R", Failure::Crash);
    script.fail_next("R", Failure::Crash);

    let err = router
        .load_model(
            "R",
            &descriptor("R", Recipe::LlamaCpp, ModelType::Reranking),
            UpgradePolicy::Upgrade,
            &ModelOverrides::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RouterError::StartupFailed { .. }));
    assert!(router.loaded_models().is_empty());
    let attempts = script.events().iter().filter(|e| *e == "load:R").count();
    assert_eq!(attempts, 2);
}

#[tokio::test]
async fn test_not_found_propagates_without_eviction() {
    let (router, script) = router();
    load(&router, "A", Recipe::LlamaCpp, ModelType::Llm).await;
    script.fail_next("E", Failure::NotFound);

    let err = router
        .load_model(
            "E",
            &descriptor("E", Recipe::LlamaCpp, ModelType::Embedding),
            UpgradePolicy::Upgrade,
            &ModelOverrides::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RouterError::NotFound(_)));
    assert_eq!(names(&router), vec!["A"]);
}

#[tokio::test]
async fn test_invalidated_model_is_never_retried() {
    let (router, script) = router();
    load(&router, "A", Recipe::LlamaCpp, ModelType::Llm).await;
    script.fail_next("N", Failure::Invalidated);

    let err = router
        .load_model(
            "N",
            &descriptor("N", Recipe::OgaHybrid, ModelType::Embedding),
            UpgradePolicy::DoNotUpgrade,
            &ModelOverrides::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RouterError::ModelInvalidated(_)));
    assert_eq!(err.status_code(), 409);
    assert_eq!(names(&router), vec!["A"]);
    let attempts = script.events().iter().filter(|e| *e == "load:N").count();
    assert_eq!(attempts, 1);
}

#[tokio::test]
async fn test_unsupported_recipe_touches_nothing() {
    let script = Arc::new(Script::default());
    let mut registry = BackendRegistry::empty();
    registry.register(
        Engine::LlamaCpp,
        Box::new(ScriptedFactory {
            script: script.clone(),
        }),
    );
    let router = Router::new(RouterConfig::default(), registry, Arc::new(NoSpawner)).unwrap();
    load(&router, "A", Recipe::LlamaCpp, ModelType::Llm).await;

    let err = router
        .load_model(
            "W",
            &descriptor("W", Recipe::WhisperCpp, ModelType::Audio),
            UpgradePolicy::Upgrade,
            &ModelOverrides::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::Config(_)));
    assert_eq!(names(&router), vec!["A"]);
}

#[tokio::test]
async fn test_stream_relays_through_done() {
    let (router, _script) = router();
    load(&router, "A", Recipe::LlamaCpp, ModelType::Llm).await;

    let mut sink: Vec<u8> = Vec::new();
    let summary = router
        .chat_completion_stream(json!({"model": "A", "messages": []}), &mut sink)
        .await
        .unwrap();

    let body = String::from_utf8(sink).unwrap();
    assert!(body.ends_with("data: [DONE]\n\n"));
    assert!(summary.done);
    assert_eq!(summary.payloads, 2);
    assert_eq!(summary.telemetry.output_tokens, Some(2));
    assert_eq!(router.stats().unwrap().input_tokens, Some(4));
}

#[tokio::test]
async fn test_stream_error_is_written_to_sink() {
    let (router, _script) = router();

    let mut sink: Vec<u8> = Vec::new();
    let err = router
        .completion_stream(json!({"model": "ghost", "prompt": "hi"}), &mut sink)
        .await
        .unwrap_err();

    assert!(matches!(err, RouterError::ModelNotLoaded(_)));
    let body = String::from_utf8(sink).unwrap();
    let payload: Value = serde_json::from_str(
        body.trim()
            .strip_prefix("data:")
            .unwrap()
            .trim(),
    )
    .unwrap();
    assert_eq!(payload["error"]["type"], "model_not_loaded");
}

/// Accepts the first write, then behaves like a closed connection
#[derive(Default)]
struct HangUpSink {
    received: Vec<u8>,
}

impl tokio::io::AsyncWrite for HangUpSink {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        if !self.received.is_empty() {
            return std::task::Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()));
        }
        self.received.extend_from_slice(buf);
        std::task::Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn test_client_hang_up_leaves_backend_loaded() {
    let (router, script) = router();
    load(&router, "A", Recipe::LlamaCpp, ModelType::Llm).await;

    let mut sink = HangUpSink::default();
    let err = router
        .chat_completion_stream(json!({"model": "A", "messages": []}), &mut sink)
        .await
        .unwrap_err();

    assert!(matches!(err, RouterError::ClientDisconnected));
    assert_eq!(err.status_code(), 499);
    assert!(!sink.received.is_empty());
    assert!(router.is_loaded("A"));
    assert!(!script.events().iter().any(|e| e.starts_with("unload:")));

    // Busy was cleared, so unloading does not wait on the abandoned stream
    tokio::time::timeout(Duration::from_secs(2), router.unload_model("A"))
        .await
        .expect("unload waited on a released request")
        .unwrap();
    assert!(script.events().contains(&"unload:A".to_string()));
}

#[tokio::test]
async fn test_crashed_backend_is_removed() {
    let (router, script) = router();
    load(&router, "A", Recipe::LlamaCpp, ModelType::Llm).await;
    script.kill("A");

    let response = router.chat_completion(json!({"model": "A"})).await;
    assert_eq!(response["error"]["type"], "network_error");
    assert!(!router.is_loaded("A"));

    // Next load starts it fresh
    load(&router, "A", Recipe::LlamaCpp, ModelType::Llm).await;
    let loads = script.events().iter().filter(|e| *e == "load:A").count();
    assert_eq!(loads, 2);
}

#[tokio::test]
async fn test_check_health_sweeps_dead_instances() {
    let (router, script) = router();
    load(&router, "A", Recipe::LlamaCpp, ModelType::Llm).await;
    load(&router, "E", Recipe::LlamaCpp, ModelType::Embedding).await;
    script.kill("E");

    assert_eq!(router.check_health().await, vec!["E".to_string()]);
    assert_eq!(names(&router), vec!["A"]);
}

#[tokio::test]
async fn test_unload() {
    let (router, script) = router();
    load(&router, "A", Recipe::LlamaCpp, ModelType::Llm).await;
    load(&router, "E", Recipe::LlamaCpp, ModelType::Embedding).await;

    let err = router.unload_model("nope").await.unwrap_err();
    assert!(matches!(err, RouterError::ModelNotLoaded(_)));

    router.unload_model("A").await.unwrap();
    assert_eq!(names(&router), vec!["E"]);

    router.unload_model("").await.unwrap();
    assert!(router.loaded_models().is_empty());
    assert!(script.events().contains(&"unload:E".to_string()));

    // Unloading everything when nothing is loaded is fine
    router.unload_model("").await.unwrap();
}

#[tokio::test]
async fn test_attach_unsupported_engine_evicts_nothing() {
    let (router, script) = router();
    load(&router, "A", Recipe::LlamaCpp, ModelType::Llm).await;

    let err = router
        .attach_model(
            "B",
            &descriptor("B", Recipe::LlamaCpp, ModelType::Llm),
            "http://127.0.0.1:9",
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RouterError::UnsupportedOperation(_)));
    assert_eq!(names(&router), vec!["A"]);
    assert!(!script.events().iter().any(|e| e.starts_with("unload:")));
    assert!(!router.is_loading());
}

#[cfg(feature = "backend-llamacpp")]
#[tokio::test]
async fn test_attach_running_llama_server() {
    use axum::routing::{get, post};

    let app = axum::Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/v1/chat/completions",
            post(|axum::Json(body): axum::Json<Value>| async move {
                axum::Json(json!({
                    "model": body["model"],
                    "choices": [{"message": {"content": "attached"}}],
                    "timings": {"prompt_n": 3, "predicted_n": 1}
                }))
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let router = Router::new(
        RouterConfig::default(),
        BackendRegistry::new(),
        Arc::new(NoSpawner),
    )
    .unwrap();
    router
        .attach_model(
            "Qwen3-0.6B-GGUF",
            &descriptor("Qwen3-0.6B-GGUF", Recipe::LlamaCpp, ModelType::Llm),
            &url,
        )
        .await
        .unwrap();

    let loaded = router.loaded_models();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].base_url.as_deref(), Some(url.as_str()));

    let response = router
        .chat_completion(json!({"model": "Qwen3-0.6B-GGUF", "messages": []}))
        .await;
    assert_eq!(response["choices"][0]["message"]["content"], "attached");
    assert_eq!(router.stats().unwrap().input_tokens, Some(3));

    // Unloading detaches without stopping the server
    router.unload_model("Qwen3-0.6B-GGUF").await.unwrap();
    assert!(router.loaded_models().is_empty());
    let health = reqwest::get(format!("{}/health", url)).await.unwrap();
    assert!(health.status().is_success());
}

#[tokio::test]
async fn test_loaded_models_report() {
    let (router, _script) = router();
    let mut d = descriptor("hybrid", Recipe::OgaHybrid, ModelType::Llm);
    d.labels = vec!["reasoning".to_string()];
    router
        .load_model("hybrid", &d, UpgradePolicy::Upgrade, &ModelOverrides::default())
        .await
        .unwrap();

    let models = router.loaded_models();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].checkpoint, "org/hybrid");
    assert_eq!(models[0].recipe, Recipe::OgaHybrid);
    assert_eq!(models[0].device, DeviceMask::NPU | DeviceMask::GPU);
    assert_eq!(models[0].base_url.as_deref(), Some("http://127.0.0.1/hybrid"));

    let json = serde_json::to_value(&models[0]).unwrap();
    assert_eq!(json["type"], "llm");
}
