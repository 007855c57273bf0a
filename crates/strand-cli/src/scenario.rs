//! Scenario files
//!
//! A scenario is a TOML document with an optional `[runtime]` table (a
//! [`RuntimeConfig`]) and one `[[service]]` entry per service:
//!
//! ```toml
//! [runtime]
//! worker = 4
//!
//! [[service]]
//! label = "root"
//! program = "supervisor"
//! args = { expect = 1 }
//!
//! [[service]]
//! label = "ping"
//! program = "ping"
//! worker = 1
//! args = { target = "pong", count = 1000 }
//! ```
//!
//! The service with `id = 1`, or else the first one listed, is root.

use anyhow::{bail, Context};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;
use std::path::Path;
use strand::{RuntimeConfig, ServiceId};

/// One `[[service]]` entry
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    /// Unique name, also used as the service label
    pub label: String,
    /// Built-in program to run
    pub program: String,
    /// Explicit service id
    #[serde(default)]
    pub id: Option<u32>,
    /// Worker to pin the service to
    #[serde(default)]
    pub worker: Option<usize>,
    /// Run on a dedicated thread
    #[serde(default)]
    pub exclusive: bool,
    /// Program arguments
    #[serde(default)]
    pub args: toml::Table,
}

/// A parsed scenario file
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Runtime sizing
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Services in file order
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceSpec>,
}

/// A service with its id decided
#[derive(Debug, Clone)]
pub struct Planned {
    pub id: ServiceId,
    pub spec: ServiceSpec,
}

impl Planned {
    /// Engine source name under which this service's program is registered
    pub fn source(&self) -> String {
        format!("{}@{}", self.spec.program, self.spec.label)
    }
}

impl Scenario {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read scenario {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("invalid scenario {}", path.display()))
    }

    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Assign ids: root gets 1, explicit ids are kept, the rest count up
    /// from 2 skipping taken ones.
    pub fn plan(&self) -> anyhow::Result<Vec<Planned>> {
        if self.services.is_empty() {
            bail!("scenario has no services");
        }
        let mut labels = FxHashSet::default();
        let mut taken = FxHashSet::default();
        for spec in &self.services {
            if !labels.insert(spec.label.as_str()) {
                bail!("duplicate service label '{}'", spec.label);
            }
            if let Some(id) = spec.id {
                if id == 0 {
                    bail!("service '{}': id 0 is reserved", spec.label);
                }
                if !taken.insert(id) {
                    bail!("service '{}': id {} is used twice", spec.label, id);
                }
            }
        }
        let root_index = self
            .services
            .iter()
            .position(|s| s.id == Some(1))
            .unwrap_or(0);
        if let Some(id) = self.services[root_index].id {
            if id != 1 {
                bail!(
                    "service '{}' is root and cannot take id {}",
                    self.services[root_index].label,
                    id
                );
            }
        }
        taken.insert(1);

        let mut next = 2;
        let mut plan = Vec::with_capacity(self.services.len());
        for (i, spec) in self.services.iter().enumerate() {
            let id = match spec.id {
                Some(id) => id,
                None if i == root_index => 1,
                None => {
                    while taken.contains(&next) {
                        next += 1;
                    }
                    taken.insert(next);
                    next
                }
            };
            plan.push(Planned {
                id: ServiceId::new(id),
                spec: spec.clone(),
            });
        }
        Ok(plan)
    }
}

/// Label to id lookup over a plan
pub fn label_index(plan: &[Planned]) -> FxHashMap<&str, ServiceId> {
    plan.iter().map(|p| (p.spec.label.as_str(), p.id)).collect()
}
