use crate::config::Config;
use anyhow::{Context, bail};
use bytes::Bytes;
use scatter_core::{Key, LocalCluster, Value};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Default, Serialize)]
pub struct SimulationReport {
    pub topology_id: u32,
    pub members: Vec<String>,
    pub keys_written: usize,
    pub keys_verified: usize,
    pub reads: usize,
    pub local_biases: usize,
    pub joins: usize,
    pub leaves: usize,
}

/// Load a cluster, read through non-owners, then join and crash nodes,
/// checking after every membership change that no key was lost.
pub async fn run(config: &Config) -> anyhow::Result<SimulationReport> {
    let simulation = &config.simulation;
    let names: Vec<&str> = simulation.nodes.iter().map(String::as_str).collect();
    let mut cluster = LocalCluster::start(config.cache.clone(), &names)
        .await
        .context("failed to start cluster")?;
    cluster.network().set_wire_encoding(simulation.wire_encoding);

    let mut report = SimulationReport::default();
    let expected = load(&cluster, simulation.keys, simulation.value_size).await?;
    report.keys_written = expected.len();

    for _ in 0..simulation.read_rounds {
        report.reads += verify(&cluster, &expected).await?;
    }
    report.local_biases = cluster.nodes().map(|node| node.bias().local_bias_count()).sum();

    for name in &simulation.joins {
        cluster
            .join(name)
            .await
            .with_context(|| format!("{} failed to join", name))?;
        report.joins += 1;
        tracing::info!("{} joined, topology {}", name, cluster.topology().id());
        report.keys_verified = verify(&cluster, &expected).await?;
    }

    for name in &simulation.leaves {
        cluster
            .leave(&[name.as_str()])
            .await
            .with_context(|| format!("{} failed to leave", name))?;
        report.leaves += 1;
        tracing::info!("{} left, topology {}", name, cluster.topology().id());
        report.keys_verified = verify(&cluster, &expected).await?;
    }

    cluster.flush_invalidations().await;
    for node in cluster.nodes() {
        node.manager().print_table();
    }

    report.topology_id = cluster.topology().id();
    report.members = cluster
        .topology()
        .members()
        .iter()
        .map(ToString::to_string)
        .collect();
    cluster.stop();
    Ok(report)
}

async fn load(cluster: &LocalCluster, keys: usize, value_size: usize) -> anyhow::Result<BTreeMap<Key, Value>> {
    let nodes: Vec<_> = cluster.nodes().cloned().collect();
    let mut expected = BTreeMap::new();

    for (i, chunk) in (0..keys).collect::<Vec<_>>().chunks(64).enumerate() {
        let entries: Vec<(Key, Value)> = chunk
            .iter()
            .map(|index| (Bytes::from(format!("key-{:06}", index)), value_for(*index, value_size)))
            .collect();
        let writer = &nodes[i % nodes.len()];
        writer
            .put_all(entries.clone())
            .await
            .with_context(|| format!("bulk write through {} failed", writer.id()))?;
        expected.extend(entries);
    }

    tracing::info!("Loaded {} keys into {} nodes", expected.len(), nodes.len());
    Ok(expected)
}

/// Read every key through a rotating member. Returns the number of keys read.
async fn verify(cluster: &LocalCluster, expected: &BTreeMap<Key, Value>) -> anyhow::Result<usize> {
    let nodes: Vec<_> = cluster.nodes().cloned().collect();
    for (i, (key, value)) in expected.iter().enumerate() {
        let reader = &nodes[i % nodes.len()];
        let actual = reader
            .get(key.clone())
            .await
            .with_context(|| format!("read through {} failed", reader.id()))?;
        if actual.as_ref() != Some(value) {
            bail!(
                "key {} read through {} returned {:?}",
                String::from_utf8_lossy(key),
                reader.id(),
                actual
            );
        }
    }
    Ok(expected.len())
}

fn value_for(index: usize, size: usize) -> Value {
    let seed = format!("value-{}-", index);
    Bytes::from(seed.bytes().cycle().take(size.max(seed.len())).collect::<Vec<u8>>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use scatter_core::ScatteredConfig;

    #[tokio::test]
    async fn test_simulation_keeps_every_key() {
        let config = Config {
            cache: ScatteredConfig {
                num_segments: 32,
                remote_timeout_ms: 2_000,
                state_transfer_timeout_ms: 10_000,
                ..ScatteredConfig::default()
            },
            simulation: SimulationConfig {
                nodes: vec!["a".to_string(), "b".to_string(), "c".to_string()],
                joins: vec!["d".to_string()],
                leaves: vec!["b".to_string()],
                keys: 200,
                value_size: 16,
                read_rounds: 2,
                wire_encoding: true,
            },
        };

        let report = run(&config).await.unwrap();
        assert_eq!(report.keys_written, 200);
        assert_eq!(report.keys_verified, 200);
        assert_eq!(report.joins, 1);
        assert_eq!(report.leaves, 1);
        assert_eq!(report.members, vec!["a", "c", "d"]);
        assert!(report.local_biases > 0);
    }
}
