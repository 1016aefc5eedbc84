//! Profile data structures
//!
//! These types represent the merged output of one sampling session, suitable
//! for upload and rendering in a viewer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A single frame in a stack trace
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Frame {
    /// Function or method name
    pub function: String,

    /// Owning module, class or library (if known)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,

    /// Line number (if available)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl Frame {
    /// Create a frame that only carries a function name
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            module: None,
            line: None,
        }
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(module) = &self.module {
            write!(f, "{}.", module)?;
        }
        write!(f, "{}", self.function)?;
        if let Some(line) = self.line {
            write!(f, ":{}", line)?;
        }
        Ok(())
    }
}

/// A complete stack trace
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Stack {
    /// Frames from innermost (top) to outermost (bottom)
    pub frames: Vec<Frame>,
}

impl Stack {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self { frames }
    }

    /// Build a stack from plain function names, innermost first
    pub fn from_names(names: &[&str]) -> Self {
        Self {
            frames: names.iter().map(|n| Frame::new(*n)).collect(),
        }
    }

    /// Folded representation (outermost first, `;` separated)
    pub fn folded(&self) -> String {
        self.frames
            .iter()
            .rev()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// Number of samples that observed one particular stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackCount {
    pub stack: Stack,
    pub samples: u64,
}

/// Samples merged for one thread (or one group of threads)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadProfile {
    /// Thread or thread-group name
    pub name: String,

    /// Total samples attributed to this thread
    pub total_samples: u64,

    /// Distinct stacks, most sampled first
    pub stacks: Vec<StackCount>,
}

/// Presentation order of threads in a profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeOrder {
    /// Most sampled (i.e. most time spent) first
    ByTime,
    /// Alphabetical by thread name
    ByName,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown node order: {0}")]
pub struct UnknownNodeOrder(String);

impl FromStr for NodeOrder {
    type Err = UnknownNodeOrder;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "time" | "by-time" => Ok(NodeOrder::ByTime),
            "name" | "by-name" => Ok(NodeOrder::ByName),
            other => Err(UnknownNodeOrder(other.to_string())),
        }
    }
}

/// Merged profile data for one sampling session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Session start, milliseconds since UNIX epoch
    pub start_time_ms: u64,

    /// Session end, milliseconds since UNIX epoch
    pub end_time_ms: u64,

    /// Sampling interval in microseconds
    pub interval_us: u64,

    /// Per-thread sample data
    pub threads: Vec<ThreadProfile>,
}

impl Profile {
    /// Create a new empty profile
    pub fn new(start_time_ms: u64, end_time_ms: u64, interval_us: u64) -> Self {
        Self {
            start_time_ms,
            end_time_ms,
            interval_us,
            threads: Vec::new(),
        }
    }

    /// Total number of samples across all threads
    pub fn total_samples(&self) -> u64 {
        self.threads.iter().map(|t| t.total_samples).sum()
    }

    /// Get the duration of the profile in milliseconds
    pub fn duration_ms(&self) -> u64 {
        self.end_time_ms.saturating_sub(self.start_time_ms)
    }

    /// Reorder threads for presentation
    pub fn sort_threads(&mut self, order: NodeOrder) {
        match order {
            NodeOrder::ByTime => self.threads.sort_by(|a, b| {
                b.total_samples
                    .cmp(&a.total_samples)
                    .then_with(|| a.name.cmp(&b.name))
            }),
            NodeOrder::ByName => self.threads.sort_by(|a, b| a.name.cmp(&b.name)),
        }
    }

    pub fn thread(&self, name: &str) -> Option<&ThreadProfile> {
        self.threads.iter().find(|t| t.name == name)
    }
}
