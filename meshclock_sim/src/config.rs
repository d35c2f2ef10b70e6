//! Mesh configuration: defaults, TOML file loading and validation.
//!
//! Every peer receives its own copy of `MeshConfig`; nothing is read from
//! global state once the mesh is running.

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How a peer turns a policy decision into channel activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Discipline {
    /// Send to a uniformly random peer, or wait for read readiness for a
    /// random bounded interval.
    RandomTarget,
    /// Wait a fixed interval for write or read readiness; sends go to a peer
    /// whose endpoint reported writable.
    Readiness,
}

impl Discipline {
    pub fn name(&self) -> &'static str {
        match self {
            Discipline::RandomTarget => "random-target",
            Discipline::Readiness => "readiness",
        }
    }
}

/// Configuration for one mesh run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeshConfig {
    /// Number of peers (default 4).
    #[serde(default = "default_num_peers")]
    pub num_peers: usize,
    /// Snapshot count (default 5). Carried for compatibility, not used.
    #[serde(default = "default_num_snapshots")]
    pub num_snapshots: usize,
    /// Base seed; peer `i` seeds its RNG with `seed + i` (default 100).
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Starting balance of every peer (default 100).
    #[serde(default = "default_initial_balance")]
    pub initial_balance: i64,
    #[serde(default = "default_discipline")]
    pub discipline: Discipline,
    /// Outcomes the action policy draws from (default 5).
    #[serde(default = "default_choice_outcomes")]
    pub choice_outcomes: u32,
    /// How many of those outcomes mean "send" (default 4).
    #[serde(default = "default_send_outcomes")]
    pub send_outcomes: u32,
    /// Lower bound of the random receive wait (default 1).
    #[serde(default = "default_min_wait_ms")]
    pub min_wait_ms: u64,
    /// Upper bound of the random receive wait (default 300).
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    /// Readiness wait under `Discipline::Readiness` (default 100).
    #[serde(default = "default_fixed_wait_ms")]
    pub fixed_wait_ms: u64,
    /// How long a send may wait for write readiness before the rest of its
    /// frame is left queued for a later step (default 10).
    #[serde(default = "default_write_wait_ms")]
    pub write_wait_ms: u64,
    /// Pause between event-loop steps (default 1000).
    #[serde(default = "default_step_interval_ms")]
    pub step_interval_ms: u64,
    /// Stop each peer after this many steps; unbounded when absent.
    #[serde(default)]
    pub max_steps: Option<u64>,
    /// Directory for `peer_<id>.log` files; in-memory only when absent.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_num_peers() -> usize {
    4
}
fn default_num_snapshots() -> usize {
    5
}
fn default_seed() -> u64 {
    100
}
fn default_initial_balance() -> i64 {
    100
}
fn default_discipline() -> Discipline {
    Discipline::RandomTarget
}
fn default_choice_outcomes() -> u32 {
    5
}
fn default_send_outcomes() -> u32 {
    4
}
fn default_min_wait_ms() -> u64 {
    1
}
fn default_max_wait_ms() -> u64 {
    300
}
fn default_fixed_wait_ms() -> u64 {
    100
}
fn default_write_wait_ms() -> u64 {
    10
}
fn default_step_interval_ms() -> u64 {
    1000
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            num_peers: default_num_peers(),
            num_snapshots: default_num_snapshots(),
            seed: default_seed(),
            initial_balance: default_initial_balance(),
            discipline: default_discipline(),
            choice_outcomes: default_choice_outcomes(),
            send_outcomes: default_send_outcomes(),
            min_wait_ms: default_min_wait_ms(),
            max_wait_ms: default_max_wait_ms(),
            fixed_wait_ms: default_fixed_wait_ms(),
            write_wait_ms: default_write_wait_ms(),
            step_interval_ms: default_step_interval_ms(),
            max_steps: None,
            log_dir: None,
        }
    }
}

impl MeshConfig {
    /// Loads a TOML file; missing keys take their defaults.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn with_peers(mut self, num_peers: usize) -> Self {
        self.num_peers = num_peers;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_max_steps(mut self, steps: u64) -> Self {
        self.max_steps = Some(steps);
        self
    }

    pub fn with_step_interval_ms(mut self, ms: u64) -> Self {
        self.step_interval_ms = ms;
        self
    }

    pub fn with_wait_range_ms(mut self, min: u64, max: u64) -> Self {
        self.min_wait_ms = min;
        self.max_wait_ms = max;
        self
    }

    pub fn with_write_wait_ms(mut self, ms: u64) -> Self {
        self.write_wait_ms = ms;
        self
    }

    pub fn with_discipline(mut self, discipline: Discipline) -> Self {
        self.discipline = discipline;
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Rejects configurations a mesh cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_peers < 2 {
            return Err(ConfigError::Invalid(format!(
                "num_peers must be at least 2, got {}",
                self.num_peers
            )));
        }
        if self.choice_outcomes == 0 {
            return Err(ConfigError::Invalid("choice_outcomes cannot be 0".to_string()));
        }
        if self.send_outcomes > self.choice_outcomes {
            return Err(ConfigError::Invalid(format!(
                "send_outcomes ({}) exceeds choice_outcomes ({})",
                self.send_outcomes, self.choice_outcomes
            )));
        }
        if self.min_wait_ms > self.max_wait_ms {
            return Err(ConfigError::Invalid(format!(
                "min_wait_ms ({}) exceeds max_wait_ms ({})",
                self.min_wait_ms, self.max_wait_ms
            )));
        }
        Ok(())
    }

    /// RNG seed for peer `id`.
    pub fn peer_seed(&self, id: usize) -> u64 {
        self.seed.wrapping_add(id as u64)
    }

    pub fn receive_wait_range_ms(&self) -> RangeInclusive<u64> {
        self.min_wait_ms..=self.max_wait_ms
    }

    pub fn fixed_wait(&self) -> Duration {
        Duration::from_millis(self.fixed_wait_ms)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }

    pub fn step_interval(&self) -> Duration {
        Duration::from_millis(self.step_interval_ms)
    }
}
