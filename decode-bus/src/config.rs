use std::num::NonZeroUsize;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::codec::Discard;
use crate::error::{Error, Result};

pub const DEFAULT_MAX_AUTO_THREADS: usize = 16;
pub const DEFAULT_DRAIN_ERROR_BASE: usize = 20;

/// How many errors without output are tolerated while draining before the
/// decoder gives up and reports end of stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DrainErrorBudget {
    /// `base` plus the number of threads.
    Auto { base: usize },
    Fixed(usize),
}

impl Default for DrainErrorBudget {
    fn default() -> Self {
        DrainErrorBudget::Auto {
            base: DEFAULT_DRAIN_ERROR_BASE,
        }
    }
}

impl DrainErrorBudget {
    pub fn limit(&self, thread_count: usize) -> usize {
        match *self {
            DrainErrorBudget::Auto { base } => base + thread_count,
            DrainErrorBudget::Fixed(n) => n,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DecoderConfig {
    /// 0 picks a count from the available cores.
    pub thread_count: usize,
    pub max_auto_threads: usize,
    /// Bitstream filters applied before decoding, e.g. `"mp4toannexb,chunk=size=512"`.
    pub filters: String,
    pub drain_error_budget: DrainErrorBudget,
    /// Accelerator name, or `"auto"` for the first one registered for the codec.
    pub accel: Option<String>,
    pub skip_frame: Discard,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            thread_count: 0,
            max_auto_threads: DEFAULT_MAX_AUTO_THREADS,
            filters: "null".to_string(),
            drain_error_budget: DrainErrorBudget::default(),
            accel: None,
            skip_frame: Discard::None,
        }
    }
}

impl DecoderConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| Error::InvalidArgument(format!("bad decoder config: {}", e)))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidArgument(format!("read {}: {}", path.display(), e)))?;
        Self::from_json_str(&s)
    }

    pub fn with_threads(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    pub fn with_filters(mut self, filters: &str) -> Self {
        self.filters = filters.to_string();
        self
    }

    /// Thread count to run with; 1 means no worker threads.
    pub fn resolve_thread_count(&self) -> usize {
        if self.thread_count > 0 {
            return self.thread_count;
        }
        let cpus = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        auto_thread_count(cpus, self.max_auto_threads)
    }
}

/// One thread per core plus one, capped at `max`. A single core gets no
/// worker threads at all.
pub fn auto_thread_count(cpus: usize, max: usize) -> usize {
    if cpus > 1 {
        (cpus + 1).min(max.max(1))
    } else {
        1
    }
}
