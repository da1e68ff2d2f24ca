//! BackendServer - sidecar process lifecycle shared by every engine adapter
//!
//! This module manages one engine server process, including:
//! - Spawning it on a freshly allocated loopback port
//! - Polling its readiness endpoint until it answers, exits or times out
//! - Attaching to an engine that is already running elsewhere
//! - Shutdown and port release

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::backend::{BackendError, HttpForwarder, LoadContext};
use crate::constants::{hosts, timeouts};
use crate::ports::PortAllocator;
use crate::process::{ProcessCommand, ProcessError, ProcessHandle};

fn is_oom_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    if lower.contains("out of memory") {
        return true;
    }
    if lower.contains("outofdevicememory") || lower.contains("erroroutofdevicememory") {
        return true;
    }
    if lower.contains("device memory allocation") {
        return true;
    }
    if lower.contains("failed to allocate")
        && (lower.contains("vulkan") || lower.contains("cuda") || lower.contains("rocm"))
    {
        return true;
    }
    lower.contains("ggml_gallocr") && lower.contains("failed to allocate")
}

fn is_invalidated_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.contains("model invalidated") || lower.contains("incompatible model")
}

fn oom_error_message(hint: Option<&str>) -> String {
    match hint {
        Some(line) if !line.is_empty() => format!("Out of device memory (OOM): {}", line),
        _ => "Out of device memory (OOM).".to_string(),
    }
}

/// Turn the output of a process that died during startup into an error
fn startup_error(engine: &str, exit_code: Option<i32>, tail: &[String]) -> BackendError {
    if let Some(line) = tail.iter().find(|l| is_invalidated_line(l)) {
        return BackendError::ModelInvalidated(format!("{}: {}", engine, line.trim()));
    }
    if let Some(line) = tail.iter().find(|l| is_oom_line(l)) {
        return BackendError::OutOfMemory {
            message: oom_error_message(Some(line.trim())),
            exit_code,
        };
    }

    let last = tail
        .iter()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(|l| format!(": {}", l.trim()))
        .unwrap_or_default();
    let code = exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    BackendError::StartupFailed {
        message: format!(
            "{} exited with code {} before becoming ready{}",
            engine, code, last
        ),
        exit_code,
    }
}

/// Server operating mode
#[derive(Debug, Clone, PartialEq)]
enum ServerMode {
    /// No server running
    None,
    /// Attached to a server started by someone else
    External { url: String },
    /// Sidecar process owned by this server
    Sidecar { port: u16 },
}

/// Manages one engine server process
pub struct BackendServer {
    engine: &'static str,
    mode: ServerMode,
    child: Mutex<Option<Arc<dyn ProcessHandle>>>,
    /// Port held for the sidecar, returned exactly once on stop
    lease: Mutex<Option<(Arc<PortAllocator>, u16)>>,
    http: Option<HttpForwarder>,
    ready: AtomicBool,
}

impl BackendServer {
    pub fn new(engine: &'static str) -> Self {
        Self {
            engine,
            mode: ServerMode::None,
            child: Mutex::new(None),
            lease: Mutex::new(None),
            http: None,
            ready: AtomicBool::new(false),
        }
    }

    /// Attach to an engine that is already running.
    ///
    /// Tries `/health` first and falls back to `/v1/models` for servers that
    /// have no health endpoint.
    pub async fn connect_external(
        &mut self,
        url: &str,
        client: reqwest::Client,
        request_timeout: Duration,
    ) -> Result<(), BackendError> {
        self.stop();

        let http = HttpForwarder::new(client, url, request_timeout);
        if !http.probe("/health").await && !http.probe("/v1/models").await {
            return Err(BackendError::Network(format!(
                "no {} server answering at {}",
                self.engine, url
            )));
        }

        self.mode = ServerMode::External {
            url: http.base_url().to_string(),
        };
        self.http = Some(http);
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Allocate a port, spawn the engine built by `build` on it and wait for
    /// `probe_path` to answer.
    pub async fn start_sidecar<F>(
        &mut self,
        context: &LoadContext,
        probe_path: &str,
        build: F,
    ) -> Result<(), BackendError>
    where
        F: FnOnce(u16) -> ProcessCommand,
    {
        self.stop();

        let port = context.ports.allocate().ok_or_else(|| BackendError::StartupFailed {
            message: format!(
                "no free port in {}..+{}",
                context.config.port_base, context.config.port_range
            ),
            exit_code: None,
        })?;
        *self.lease.lock() = Some((context.ports.clone(), port));
        self.mode = ServerMode::Sidecar { port };

        let mut command = build(port).debug(context.config.debug_backends);
        // Engines find their bundled runtime libraries relative to the
        // install folder
        if command.cwd.is_none() {
            if let Some(dir) = command
                .program
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .map(Path::to_path_buf)
            {
                command = command.cwd(dir);
            }
        }
        let child = match context.spawner.spawn(&command).await {
            Ok(child) => child,
            Err(e) => {
                self.stop();
                return Err(match e {
                    ProcessError::NotFound(path) => BackendError::NotFound(format!(
                        "{} executable not found: {}",
                        self.engine,
                        path.display()
                    )),
                    other => BackendError::StartupFailed {
                        message: other.to_string(),
                        exit_code: None,
                    },
                });
            }
        };
        log::info!(
            "Started {} (PID: {}) on port {}",
            self.engine,
            child.pid(),
            port
        );
        *self.child.lock() = Some(Arc::from(child));

        let base_url = format!("http://{}:{}", hosts::LOCAL, port);
        self.http = Some(HttpForwarder::new(
            context.http.clone(),
            &base_url,
            context.config.request_timeout(),
        ));

        self.wait_for_ready(
            probe_path,
            context.config.load_timeout(),
            context.config.probe_interval(),
        )
        .await
    }

    /// Poll `probe_path` until it answers, the process exits, or `timeout`
    /// elapses
    async fn wait_for_ready(
        &self,
        probe_path: &str,
        timeout: Duration,
        interval: Duration,
    ) -> Result<(), BackendError> {
        let http = self.http.as_ref().ok_or(BackendError::NotReady)?;
        let start = Instant::now();

        log::debug!("Waiting for {} at {}{}", self.engine, http.base_url(), probe_path);

        loop {
            let exited = self
                .child
                .lock()
                .as_ref()
                .filter(|child| !child.is_running())
                .cloned();
            if let Some(child) = exited {
                let drain = Duration::from_millis(timeouts::OUTPUT_DRAIN_MS);
                if tokio::time::timeout(drain, child.wait_output_closed())
                    .await
                    .is_err()
                {
                    log::debug!("{} output still open after exit", self.engine);
                }
                let err = startup_error(self.engine, child.exit_code(), &child.output_tail());
                self.stop();
                log::warn!("{}", err);
                return Err(err);
            }

            if http.probe(probe_path).await {
                log::info!(
                    "{} ready after {:.1}s",
                    self.engine,
                    start.elapsed().as_secs_f32()
                );
                self.ready.store(true, Ordering::SeqCst);
                return Ok(());
            }

            if start.elapsed() >= timeout {
                self.stop();
                return Err(BackendError::Timeout(format!(
                    "{} did not become ready within {}s",
                    self.engine,
                    timeout.as_secs()
                )));
            }

            tokio::time::sleep(interval).await;
        }
    }

    pub fn http(&self) -> Result<&HttpForwarder, BackendError> {
        if !self.is_ready() {
            return Err(BackendError::NotReady);
        }
        self.http.as_ref().ok_or(BackendError::NotReady)
    }

    pub fn base_url(&self) -> Option<String> {
        match &self.mode {
            ServerMode::None => None,
            ServerMode::External { url } => Some(url.clone()),
            ServerMode::Sidecar { port } => Some(format!("http://{}:{}", hosts::LOCAL, port)),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Whether the owned process is still running. Attached servers are
    /// assumed alive.
    pub fn is_alive(&self) -> bool {
        match &self.mode {
            ServerMode::None => false,
            ServerMode::External { .. } => true,
            ServerMode::Sidecar { .. } => self
                .child
                .lock()
                .as_ref()
                .map(|child| child.is_running())
                .unwrap_or(false),
        }
    }

    /// Kill the owned process and release its port. Attached servers are
    /// left running.
    pub fn stop(&self) {
        self.ready.store(false, Ordering::SeqCst);

        if let Some(child) = self.child.lock().take() {
            let pid = child.pid();
            log::debug!("Stopping {} (PID: {})", self.engine, pid);
            if let Err(e) = child.kill() {
                log::warn!("Failed to kill {}: {}", self.engine, e);
            }
        }

        if let Some((ports, port)) = self.lease.lock().take() {
            ports.release(port);
        }
    }
}

impl Drop for BackendServer {
    fn drop(&mut self) {
        self.stop();
    }
}
