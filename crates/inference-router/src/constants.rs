//! Router-wide constants
//!
//! Single source of truth for ports, timeouts and defaults used by the
//! router and the engine adapters.

/// Network port configuration
pub mod ports {
    /// First port handed out to backend servers. Kept clear of the ports the
    /// HTTP front end and other subsystems bind.
    pub const BACKEND_BASE: u16 = 8001;
    /// Number of ports to scan above the base
    pub const BACKEND_RANGE: u16 = 1000;
}

/// Timeout configuration
pub mod timeouts {
    /// Maximum time to wait for a backend to become ready. Large models on
    /// slow disks can take several minutes.
    pub const LOAD_READY_SECS: u64 = 600;
    /// Interval between readiness probes
    pub const PROBE_INTERVAL_MS: u64 = 500;
    /// Timeout for a single readiness probe request
    pub const PROBE_REQUEST_MS: u64 = 2000;
    /// Timeout for non-streaming requests to a running backend
    pub const REQUEST_SECS: u64 = 600;
    /// How long an exited backend's output may take to be read to the end
    pub const OUTPUT_DRAIN_MS: u64 = 2000;
}

/// Default values for load configuration
pub mod defaults {
    /// Context window used when neither the descriptor nor the overrides set one
    pub const CONTEXT_SIZE: u32 = 4096;
    /// Default number of simultaneously loaded models per type
    pub const MAX_LOADED_PER_TYPE: usize = 1;
    /// GPU layers passed to llama-server (99 offloads everything)
    pub const GPU_LAYERS: i32 = 99;
}

/// Server host configuration
pub mod hosts {
    /// Loopback address every backend binds to
    pub const LOCAL: &str = "127.0.0.1";
}

/// Executable names looked up for each engine
pub mod binaries {
    pub const LLAMA_SERVER: &str = "llama-server";
    pub const OGA_SERVER: &str = "oga-server";
    pub const FLM: &str = "flm";
    pub const WHISPER_SERVER: &str = "whisper-server";
}

/// Server-sent events framing
pub mod sse {
    /// Prefix of a payload line
    pub const DATA_PREFIX: &str = "data:";
    /// Terminal sentinel sent by OpenAI-compatible servers
    pub const DONE_SENTINEL: &str = "[DONE]";
}
