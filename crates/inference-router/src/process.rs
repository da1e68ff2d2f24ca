//! Process spawning abstraction
//!
//! Engine adapters never touch `std::process` directly. They describe what to
//! run with a [`ProcessCommand`] and hand it to a [`ProcessSpawner`], which lets
//! hosts plug in their own process management (sandboxing, bundled sidecars)
//! and lets tests run without real binaries.
//!
//! # Example
//!
//! ```rust,ignore
//! use inference_router::process::{ProcessCommand, ProcessSpawner, StdProcessSpawner};
//!
//! let spawner = StdProcessSpawner::new();
//! let command = ProcessCommand::new("/opt/llama/llama-server", "llama-server")
//!     .arg("--port")
//!     .arg("8001");
//! let handle = spawner.spawn(&command).await?;
//! assert!(handle.is_running());
//! handle.kill()?;
//! ```

use std::path::PathBuf;

use async_trait::async_trait;

/// Number of trailing output lines kept per process for error reports
pub const OUTPUT_TAIL_LINES: usize = 40;

/// Error starting or controlling a process
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Executable not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("Failed to kill process {pid}: {message}")]
    Kill { pid: u32, message: String },
}

/// What to run
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Forward process output to the log at info level instead of debug
    pub debug: bool,
    /// Prefix for forwarded output lines, e.g. `llama-server`
    pub log_prefix: String,
}

impl ProcessCommand {
    pub fn new(program: impl Into<PathBuf>, log_prefix: &str) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            debug: false,
            log_prefix: log_prefix.to_string(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

/// Handle to a spawned process
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID
    fn pid(&self) -> u32;
    /// Whether the process has not exited yet
    fn is_running(&self) -> bool;
    /// Exit code once the process has exited (None while running or when
    /// killed by a signal)
    fn exit_code(&self) -> Option<i32>;
    /// Last lines the process wrote to stdout/stderr
    fn output_tail(&self) -> Vec<String>;
    /// Resolves once stdout and stderr have been read to the end. After an
    /// exit, `output_tail` is only complete once this returns.
    async fn wait_output_closed(&self) {}
    /// Kill the process
    fn kill(&self) -> Result<(), ProcessError>;
}

/// Trait for spawning backend processes
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    async fn spawn(&self, command: &ProcessCommand) -> Result<Box<dyn ProcessHandle>, ProcessError>;
}

/// True for llama.cpp metadata dumps that drown out useful output
pub(crate) fn is_noise_line(line: &str) -> bool {
    line.contains("llama_model_loader: - kv") || line.contains("llama_model_loader: - type")
}

// ============================================================================
// Standard Process Spawner
// ============================================================================

#[cfg(feature = "std-process")]
mod std_process {
    use super::*;
    use std::collections::VecDeque;
    use std::process::Stdio;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
    use tokio::process::{Child, Command};
    use tokio::sync::Notify;

    /// Output shared between the reader tasks and the handle
    #[derive(Default)]
    struct Output {
        tail: Mutex<VecDeque<String>>,
        open_streams: AtomicUsize,
        closed: Notify,
    }

    impl Output {
        fn push(&self, line: String) {
            let mut tail = self.tail.lock();
            if tail.len() == OUTPUT_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }

        fn close_stream(&self) {
            if self.open_streams.fetch_sub(1, Ordering::SeqCst) == 1 {
                self.closed.notify_waiters();
            }
        }
    }

    /// tokio process handle
    struct StdProcessHandle {
        child: Mutex<Child>,
        pid: u32,
        exit_code: Mutex<Option<i32>>,
        output: Arc<Output>,
    }

    #[async_trait]
    impl ProcessHandle for StdProcessHandle {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn is_running(&self) -> bool {
            let mut child = self.child.lock();
            match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    *self.exit_code.lock() = status.code();
                    false
                }
                Err(e) => {
                    log::warn!("Failed to poll process {}: {}", self.pid, e);
                    false
                }
            }
        }

        fn exit_code(&self) -> Option<i32> {
            if self.is_running() {
                return None;
            }
            *self.exit_code.lock()
        }

        fn output_tail(&self) -> Vec<String> {
            self.output.tail.lock().iter().cloned().collect()
        }

        async fn wait_output_closed(&self) {
            loop {
                let closed = self.output.closed.notified();
                if self.output.open_streams.load(Ordering::SeqCst) == 0 {
                    return;
                }
                closed.await;
            }
        }

        fn kill(&self) -> Result<(), ProcessError> {
            let mut child = self.child.lock();
            if let Ok(Some(_)) = child.try_wait() {
                return Ok(());
            }
            child.start_kill().map_err(|e| ProcessError::Kill {
                pid: self.pid,
                message: e.to_string(),
            })
        }
    }

    /// Process spawner built on `tokio::process`
    ///
    /// Children are killed when their handle is dropped, so a crashed router
    /// task never leaves an orphaned engine behind.
    #[derive(Debug, Default, Clone)]
    pub struct StdProcessSpawner;

    impl StdProcessSpawner {
        pub fn new() -> Self {
            Self
        }
    }

    fn forward_output<R>(reader: R, prefix: String, debug: bool, output: Arc<Output>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        output.open_streams.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !is_noise_line(&line) {
                    if debug {
                        log::info!("[{}] {}", prefix, line);
                    } else {
                        log::debug!("[{}] {}", prefix, line);
                    }
                }
                output.push(line);
            }
            output.close_stream();
        });
    }

    #[async_trait]
    impl ProcessSpawner for StdProcessSpawner {
        async fn spawn(
            &self,
            command: &ProcessCommand,
        ) -> Result<Box<dyn ProcessHandle>, ProcessError> {
            if command.program.components().count() > 1 && !command.program.exists() {
                return Err(ProcessError::NotFound(command.program.clone()));
            }

            let mut cmd = Command::new(&command.program);
            cmd.args(&command.args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            if let Some(cwd) = &command.cwd {
                cmd.current_dir(cwd);
            }

            log::info!(
                "Spawning {} {}",
                command.program.display(),
                command.args.join(" ")
            );

            let mut child = cmd.spawn().map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ProcessError::NotFound(command.program.clone())
                } else {
                    ProcessError::Spawn {
                        program: command.program.display().to_string(),
                        source: e,
                    }
                }
            })?;

            let pid = child.id().unwrap_or_default();
            let output = Arc::new(Output::default());

            if let Some(stdout) = child.stdout.take() {
                forward_output(stdout, command.log_prefix.clone(), command.debug, output.clone());
            }
            if let Some(stderr) = child.stderr.take() {
                forward_output(
                    stderr,
                    format!("{} stderr", command.log_prefix),
                    command.debug,
                    output.clone(),
                );
            }

            Ok(Box::new(StdProcessHandle {
                child: Mutex::new(child),
                pid,
                exit_code: Mutex::new(None),
                output,
            }))
        }
    }

}

#[cfg(feature = "std-process")]
pub use std_process::StdProcessSpawner;
