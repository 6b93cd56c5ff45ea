//! Backend selection and session configuration.
//!
//! This module defines the available computation backends and the
//! [`SessionConfig`] a [`Session`](crate::session::Session) is built from.
//!
//! # Supported Backends
//!
//! - `Cpu` — range-parallel interpretation on `rayon` (default).
//! - `Wgpu` — fused WGSL kernels dispatched through `wgpu` (feature `wgpu`).
//!
//! Unlike a process-wide switch, every session carries its own configuration,
//! so independent sessions can run with different backends and eager settings
//! side by side (and tests stay deterministic).
//!
//! # Environment
//!
//! [`SessionConfig::from_env`] overlays the defaults with:
//!
//! - `BRINY_GRAPH_BACKENDS` — `cpu`, `gpu` or `cpu,gpu`
//! - `BRINY_GRAPH_EAGER` — `1`/`true` enables eager execution
//! - `BRINY_GRAPH_LAZY_THRESHOLD`, `BRINY_GRAPH_EAGER_THRESHOLD` — scheduler scores

use core::convert::TryFrom;

/// Enumeration of supported computation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(u8)]
pub enum Backend {
    /// Pure CPU-based backend (default).
    #[default]
    Cpu = 0,
    /// GPU-accelerated backend using `wgpu`.
    Wgpu,
}

impl TryFrom<u8> for Backend {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Cpu),
            1 => Ok(Self::Wgpu),
            _ => Err(()),
        }
    }
}

/// A small set of backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Backends(u8);

impl Backends {
    pub const CPU: Backends = Backends(1 << Backend::Cpu as u8);
    pub const WGPU: Backends = Backends(1 << Backend::Wgpu as u8);
    pub const ALL: Backends = Backends(Self::CPU.0 | Self::WGPU.0);

    pub const fn contains(self, backend: Backend) -> bool {
        self.0 & (1 << backend as u8) != 0
    }

    pub const fn union(self, other: Backends) -> Backends {
        Backends(self.0 | other.0)
    }

    pub const fn without(self, backend: Backend) -> Backends {
        Backends(self.0 & !(1 << backend as u8))
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn parse(list: &str) -> Option<Backends> {
        let mut set = Backends(0);
        for part in list.split(',').map(str::trim) {
            set = match part.to_ascii_lowercase().as_str() {
                "cpu" => set.union(Backends::CPU),
                "gpu" | "wgpu" => set.union(Backends::WGPU),
                _ => return None,
            };
        }
        (!set.is_empty()).then_some(set)
    }
}

impl Default for Backends {
    fn default() -> Self {
        Backends::CPU
    }
}

impl From<Backend> for Backends {
    fn from(b: Backend) -> Self {
        Backends(1 << b as u8)
    }
}

/// Scheduler and backend settings of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Backends to initialize.
    pub backends: Backends,
    /// Execute every node at construction once its inputs are materialized.
    pub eager: bool,
    /// Score above which a whole deferred subgraph goes to the accelerator.
    pub lazy_threshold: usize,
    /// Score above which a single eagerly executed node goes to the accelerator.
    pub eager_threshold: usize,
    /// Smallest index range handed to one CPU worker.
    pub cpu_chunk: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backends: Backends::CPU,
            eager: false,
            lazy_threshold: 2048,
            eager_threshold: 16384,
            cpu_chunk: 4096,
        }
    }
}

impl SessionConfig {
    pub fn with_backends(mut self, backends: impl Into<Backends>) -> Self {
        self.backends = backends.into();
        self
    }

    pub fn with_eager(mut self, eager: bool) -> Self {
        self.eager = eager;
        self
    }

    pub fn with_thresholds(mut self, lazy: usize, eager: usize) -> Self {
        self.lazy_threshold = lazy;
        self.eager_threshold = eager;
        self
    }

    pub fn with_cpu_chunk(mut self, chunk: usize) -> Self {
        self.cpu_chunk = chunk.max(1);
        self
    }

    /// Defaults overlaid with the `BRINY_GRAPH_*` environment variables.
    ///
    /// Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    fn overlay(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(list) = var("BRINY_GRAPH_BACKENDS") {
            match Backends::parse(&list) {
                Some(set) => self.backends = set,
                None => log::warn!("ignoring BRINY_GRAPH_BACKENDS={list:?}"),
            }
        }
        if let Some(flag) = var("BRINY_GRAPH_EAGER") {
            self.eager = matches!(flag.trim(), "1" | "true" | "on" | "yes");
        }
        for (key, slot) in [
            ("BRINY_GRAPH_LAZY_THRESHOLD", &mut self.lazy_threshold),
            ("BRINY_GRAPH_EAGER_THRESHOLD", &mut self.eager_threshold),
        ] {
            if let Some(raw) = var(key) {
                match raw.trim().parse() {
                    Ok(v) => *slot = v,
                    Err(_) => log::warn!("ignoring {key}={raw:?}"),
                }
            }
        }
        self
    }
}
