//! Cross-replica and cross-host reductions.
//!
//! Replicas live in one process, so reductions run on the host: gradients are
//! averaged on the lead replica's device and copied back out, metric structs
//! are summed field-wise. The host map is computed once at startup and reused
//! for every reduction that must count each host exactly once.

use std::collections::BTreeMap;

use candle_core::{Device, Tensor};
use progfill_core::{Result, SynthError};

use crate::metrics::Metrics;

/// Static placement of devices across hosts. Immutable after construction.
#[derive(Debug, Clone)]
pub struct HostTopology {
    host_id: usize,
    hosts: BTreeMap<usize, Vec<usize>>,
    local_devices: Vec<Device>,
}

impl HostTopology {
    /// Single-process topology with `num_devices` local replicas.
    pub fn single_host(num_devices: usize) -> Result<Self> {
        if num_devices == 0 {
            return Err(SynthError::Config(
                "topology requires at least one device".into(),
            ));
        }
        let mut hosts = BTreeMap::new();
        hosts.insert(0, (0..num_devices).collect());
        Ok(Self {
            host_id: 0,
            hosts,
            local_devices: vec![Device::Cpu; num_devices],
        })
    }

    pub fn with_hosts(
        host_id: usize,
        hosts: BTreeMap<usize, Vec<usize>>,
        local_devices: Vec<Device>,
    ) -> Result<Self> {
        if !hosts.contains_key(&host_id) {
            return Err(SynthError::Config(format!(
                "host {host_id} missing from topology"
            )));
        }
        Ok(Self {
            host_id,
            hosts,
            local_devices,
        })
    }

    pub fn host_id(&self) -> usize {
        self.host_id
    }

    /// Only the primary host writes checkpoints and dashboard entries.
    pub fn is_primary(&self) -> bool {
        self.host_id == 0
    }

    pub fn num_local_devices(&self) -> usize {
        self.local_devices.len()
    }

    pub fn local_devices(&self) -> &[Device] {
        &self.local_devices
    }

    pub fn num_hosts(&self) -> usize {
        self.hosts.len()
    }

    /// One representative device index per host, in host order.
    pub fn host_representatives(&self) -> impl Iterator<Item = usize> + '_ {
        self.hosts.values().filter_map(|d| d.first().copied())
    }
}

/// Average gradients across replicas, then place a copy on every device.
///
/// `per_replica[r][p]` is replica `r`'s gradient for parameter `p`, in the
/// shared sorted parameter order. A parameter unused by the step (`None` on
/// all replicas) stays `None`.
pub fn reduce_mean_grads(
    per_replica: &[Vec<Option<Tensor>>],
    devices: &[Device],
) -> Result<Vec<Vec<Option<Tensor>>>> {
    let num_replicas = per_replica.len();
    if num_replicas == 0 || num_replicas != devices.len() {
        return Err(SynthError::Config(format!(
            "gradient reduction got {num_replicas} replicas for {} devices",
            devices.len()
        )));
    }
    let num_params = per_replica[0].len();
    for grads in per_replica {
        if grads.len() != num_params {
            return Err(SynthError::Config(
                "replicas disagree on parameter count".into(),
            ));
        }
    }

    let lead = &devices[0];
    let mut means: Vec<Option<Tensor>> = Vec::with_capacity(num_params);
    for p in 0..num_params {
        let mut acc: Option<Tensor> = None;
        let mut count = 0usize;
        for grads in per_replica {
            if let Some(g) = &grads[p] {
                let g = g.to_device(lead)?;
                acc = Some(match acc {
                    Some(a) => (a + g)?,
                    None => g,
                });
                count += 1;
            }
        }
        means.push(match acc {
            Some(sum) => Some((sum / count as f64)?),
            None => None,
        });
    }

    let mut out = Vec::with_capacity(num_replicas);
    for device in devices {
        let mut copy = Vec::with_capacity(num_params);
        for mean in &means {
            copy.push(match mean {
                Some(m) => Some(m.to_device(device)?),
                None => None,
            });
        }
        out.push(copy);
    }
    Ok(out)
}

/// Field-wise sum over per-replica metrics; the caller normalizes later.
pub fn reduce_sum_metrics(per_replica: &[Metrics]) -> Metrics {
    let mut total = Metrics::default();
    for m in per_replica {
        total.merge_sum(m);
    }
    total
}

/// Sum `values` (indexed by global device) counting each host once.
///
/// Mirrors a replicated-scalar reduction where every device on a host holds
/// the same host-level value.
pub fn per_host_sum(topology: &HostTopology, values: &[f64]) -> f64 {
    topology
        .host_representatives()
        .filter_map(|d| values.get(d))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_host_topology() -> HostTopology {
        let mut hosts = BTreeMap::new();
        hosts.insert(0, vec![0, 1]);
        hosts.insert(1, vec![2, 3]);
        HostTopology::with_hosts(0, hosts, vec![Device::Cpu, Device::Cpu]).unwrap()
    }

    #[test]
    fn test_per_host_sum_counts_each_host_once() {
        let topo = two_host_topology();
        // Every device on a host carries the host's value.
        let values = [3.0, 3.0, 5.0, 5.0];
        assert_eq!(per_host_sum(&topo, &values), 8.0);
    }

    #[test]
    fn test_single_host_primary() {
        let topo = HostTopology::single_host(2).unwrap();
        assert!(topo.is_primary());
        assert_eq!(topo.num_local_devices(), 2);
        assert!(HostTopology::single_host(0).is_err());
    }

    #[test]
    fn test_reduce_mean_grads_averages() {
        let dev = Device::Cpu;
        let a = Tensor::new(&[2.0f32, 4.0], &dev).unwrap();
        let b = Tensor::new(&[4.0f32, 8.0], &dev).unwrap();
        let per_replica = vec![vec![Some(a), None], vec![Some(b), None]];
        let out = reduce_mean_grads(&per_replica, &[Device::Cpu, Device::Cpu]).unwrap();
        assert_eq!(out.len(), 2);
        for replica in &out {
            let mean = replica[0].as_ref().unwrap().to_vec1::<f32>().unwrap();
            assert_eq!(mean, vec![3.0, 6.0]);
            assert!(replica[1].is_none());
        }
    }

    #[test]
    fn test_reduce_sum_metrics() {
        let a = Metrics {
            loss: 1.0,
            accuracy: 2.0,
            denominator: 4.0,
            learning_rate: Some(0.5),
        };
        let b = Metrics {
            loss: 3.0,
            accuracy: 2.0,
            denominator: 4.0,
            learning_rate: Some(0.5),
        };
        let total = reduce_sum_metrics(&[a, b]);
        assert_eq!(total.loss, 4.0);
        assert_eq!(total.denominator, 8.0);
    }
}
