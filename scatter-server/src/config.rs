use scatter_core::{Result, ScatterError, ScatteredConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: ScatteredConfig,
    pub simulation: SimulationConfig,
}

/// Shape of an in-process cluster run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub nodes: Vec<String>,
    /// Nodes added one by one after the initial load.
    #[serde(default)]
    pub joins: Vec<String>,
    /// Nodes crashed one by one after the joins.
    #[serde(default)]
    pub leaves: Vec<String>,
    #[serde(default = "default_keys")]
    pub keys: usize,
    #[serde(default = "default_value_size")]
    pub value_size: usize,
    /// Rounds of reads through non-owners, exercising read bias.
    #[serde(default = "default_read_rounds")]
    pub read_rounds: usize,
    /// Round-trip every message through its serialized form.
    #[serde(default)]
    pub wire_encoding: bool,
}

fn default_keys() -> usize {
    1000
}

fn default_value_size() -> usize {
    64
}

fn default_read_rounds() -> usize {
    2
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(
                ::config::Environment::with_prefix("SCATTER")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| ScatterError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| ScatterError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;

        let simulation = &self.simulation;
        if simulation.nodes.is_empty() {
            return Err(ScatterError::Config(
                "simulation.nodes must name at least one node".to_string(),
            ));
        }

        let mut names = BTreeSet::new();
        for name in simulation.nodes.iter().chain(&simulation.joins) {
            if name.trim().is_empty() {
                return Err(ScatterError::Config("node names cannot be empty".to_string()));
            }
            if !names.insert(name.as_str()) {
                return Err(ScatterError::Config(format!("node '{}' is listed twice", name)));
            }
        }

        for name in &simulation.leaves {
            if !names.contains(name.as_str()) {
                return Err(ScatterError::Config(format!(
                    "node '{}' cannot leave: it never joined",
                    name
                )));
            }
        }

        if simulation.leaves.len() >= names.len() {
            return Err(ScatterError::Config(
                "at least one node must stay in the cluster".to_string(),
            ));
        }

        Ok(())
    }
}
