//! Common types shared by the router and the engine adapters

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Coarse model category. Capacity limits are enforced per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Llm,
    Embedding,
    Reranking,
    Audio,
    Image,
}

impl ModelType {
    pub const ALL: [ModelType; 5] = [
        ModelType::Llm,
        ModelType::Embedding,
        ModelType::Reranking,
        ModelType::Audio,
        ModelType::Image,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Llm => "llm",
            ModelType::Embedding => "embedding",
            ModelType::Reranking => "reranking",
            ModelType::Audio => "audio",
            ModelType::Image => "image",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bitset of compute devices a backend occupies.
///
/// Serialized as a list of device names, e.g. `["npu", "gpu"]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "Vec<String>", try_from = "Vec<String>")]
pub struct DeviceMask(u8);

impl DeviceMask {
    pub const NONE: DeviceMask = DeviceMask(0);
    pub const CPU: DeviceMask = DeviceMask(0b001);
    pub const GPU: DeviceMask = DeviceMask(0b010);
    pub const NPU: DeviceMask = DeviceMask(0b100);

    pub fn contains(&self, other: DeviceMask) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn has_npu(&self) -> bool {
        self.contains(Self::NPU)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn names(&self) -> Vec<&'static str> {
        [(Self::CPU, "cpu"), (Self::GPU, "gpu"), (Self::NPU, "npu")]
            .into_iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| name)
            .collect()
    }
}

impl std::ops::BitOr for DeviceMask {
    type Output = DeviceMask;

    fn bitor(self, rhs: DeviceMask) -> DeviceMask {
        DeviceMask(self.0 | rhs.0)
    }
}

impl fmt::Display for DeviceMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        f.write_str(&self.names().join("+"))
    }
}

impl From<DeviceMask> for Vec<String> {
    fn from(mask: DeviceMask) -> Self {
        mask.names().into_iter().map(str::to_string).collect()
    }
}

impl TryFrom<Vec<String>> for DeviceMask {
    type Error = String;

    fn try_from(names: Vec<String>) -> Result<Self, Self::Error> {
        names.iter().try_fold(DeviceMask::NONE, |mask, name| {
            let bit = match name.to_ascii_lowercase().as_str() {
                "cpu" => DeviceMask::CPU,
                "gpu" | "igpu" => DeviceMask::GPU,
                "npu" => DeviceMask::NPU,
                other => return Err(format!("unknown device: {}", other)),
            };
            Ok(mask | bit)
        })
    }
}

/// Engine family a recipe is served by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    LlamaCpp,
    Oga,
    Flm,
    Whisper,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::LlamaCpp => "llamacpp",
            Engine::Oga => "oga",
            Engine::Flm => "flm",
            Engine::Whisper => "whispercpp",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tag selecting the engine and device profile that serves a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recipe {
    #[serde(rename = "llamacpp")]
    LlamaCpp,
    #[serde(rename = "oga-npu")]
    OgaNpu,
    #[serde(rename = "oga-hybrid")]
    OgaHybrid,
    #[serde(rename = "oga-cpu")]
    OgaCpu,
    #[serde(rename = "oga-igpu")]
    OgaIgpu,
    #[serde(rename = "flm")]
    Flm,
    #[serde(rename = "whispercpp")]
    WhisperCpp,
}

impl Recipe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recipe::LlamaCpp => "llamacpp",
            Recipe::OgaNpu => "oga-npu",
            Recipe::OgaHybrid => "oga-hybrid",
            Recipe::OgaCpu => "oga-cpu",
            Recipe::OgaIgpu => "oga-igpu",
            Recipe::Flm => "flm",
            Recipe::WhisperCpp => "whispercpp",
        }
    }

    pub fn engine(&self) -> Engine {
        match self {
            Recipe::LlamaCpp => Engine::LlamaCpp,
            Recipe::OgaNpu | Recipe::OgaHybrid | Recipe::OgaCpu | Recipe::OgaIgpu => Engine::Oga,
            Recipe::Flm => Engine::Flm,
            Recipe::WhisperCpp => Engine::Whisper,
        }
    }

    /// Devices occupied when the descriptor does not name any.
    ///
    /// `engine_backend` only matters for llama.cpp, where `cpu` keeps the
    /// model off the GPU.
    pub fn default_device(&self, engine_backend: Option<&str>) -> DeviceMask {
        match self {
            Recipe::LlamaCpp => match engine_backend {
                Some(backend) if backend.eq_ignore_ascii_case("cpu") => DeviceMask::CPU,
                _ => DeviceMask::GPU,
            },
            Recipe::OgaNpu | Recipe::Flm => DeviceMask::NPU,
            Recipe::OgaHybrid => DeviceMask::NPU | DeviceMask::GPU,
            Recipe::OgaCpu | Recipe::WhisperCpp => DeviceMask::CPU,
            Recipe::OgaIgpu => DeviceMask::GPU,
        }
    }
}

impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Recipe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "llamacpp" => Ok(Recipe::LlamaCpp),
            "oga-npu" => Ok(Recipe::OgaNpu),
            "oga-hybrid" => Ok(Recipe::OgaHybrid),
            "oga-cpu" => Ok(Recipe::OgaCpu),
            "oga-igpu" => Ok(Recipe::OgaIgpu),
            "flm" => Ok(Recipe::Flm),
            "whispercpp" => Ok(Recipe::WhisperCpp),
            other => Err(format!("unknown recipe: {}", other)),
        }
    }
}

/// Resolved model description handed over by the model catalog.
///
/// The router only reads it; downloading and registry bookkeeping live
/// elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub checkpoint: String,
    pub recipe: Recipe,
    /// Model file (GGUF, whisper bin) or model directory (OGA)
    pub resolved_path: PathBuf,
    #[serde(rename = "type", default = "default_model_type")]
    pub model_type: ModelType,
    #[serde(default)]
    pub device: DeviceMask,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub context_size: Option<u32>,
    /// Engine-specific backend choice, e.g. `vulkan`, `rocm` or `cpu` for llama.cpp
    #[serde(default)]
    pub engine_backend: Option<String>,
    /// Extra command line arguments appended to the engine invocation
    #[serde(default)]
    pub engine_args: Option<String>,
}

fn default_model_type() -> ModelType {
    ModelType::Llm
}

impl ModelDescriptor {
    /// Type used for capacity accounting. Catalog labels win over the
    /// declared type so that embedding/reranking GGUFs registered as plain
    /// LLMs land in the right slot.
    pub fn effective_type(&self) -> ModelType {
        if self.has_label("embeddings") {
            ModelType::Embedding
        } else if self.has_label("reranking") {
            ModelType::Reranking
        } else {
            self.model_type
        }
    }

    /// Devices occupied once loaded.
    pub fn effective_device(&self, overrides: &ModelOverrides) -> DeviceMask {
        if !self.device.is_empty() {
            return self.device;
        }
        let engine_backend = overrides
            .engine_backend
            .as_deref()
            .or(self.engine_backend.as_deref());
        self.recipe.default_device(engine_backend)
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l.eq_ignore_ascii_case(label))
    }
}

/// Per-load overrides. Values set here win over the descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelOverrides {
    #[serde(default)]
    pub context_size: Option<u32>,
    #[serde(default)]
    pub engine_backend: Option<String>,
    #[serde(default)]
    pub engine_args: Option<String>,
}

/// Whether a load may move cached model artifacts forward to the installed
/// engine version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradePolicy {
    /// Rebuild stale artifacts for the installed engine
    #[default]
    Upgrade,
    /// Refuse to touch stale artifacts; the load fails as invalidated
    DoNotUpgrade,
}

/// Everything an adapter needs to start its engine for one model.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub name: String,
    pub descriptor: ModelDescriptor,
    pub context_size: u32,
    pub engine_backend: Option<String>,
    pub engine_args: Vec<String>,
    pub upgrade_policy: UpgradePolicy,
}

/// Split an engine argument string on whitespace. Single or double quotes
/// group a value containing spaces; a backslash escapes the next character
/// outside single quotes.
pub fn split_engine_args(args: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = args.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') | (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_word = true;
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    out.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        out.push(current);
    }
    out
}

impl LoadRequest {
    /// Merge descriptor values with overrides and the configured defaults
    pub fn new(
        name: &str,
        descriptor: &ModelDescriptor,
        upgrade_policy: UpgradePolicy,
        overrides: &ModelOverrides,
        default_context_size: u32,
    ) -> Self {
        let context_size = overrides
            .context_size
            .or(descriptor.context_size)
            .unwrap_or(default_context_size);
        let engine_backend = overrides
            .engine_backend
            .clone()
            .or_else(|| descriptor.engine_backend.clone());
        let engine_args = overrides
            .engine_args
            .as_deref()
            .or(descriptor.engine_args.as_deref())
            .map(split_engine_args)
            .unwrap_or_default();

        Self {
            name: name.to_string(),
            descriptor: descriptor.clone(),
            context_size,
            engine_backend,
            engine_args,
            upgrade_policy,
        }
    }
}
