//! Data-parallel execution over a fixed set of devices.
//!
//! A [`DeviceMesh`] owns one worker per device. Values are either [`Replicated`] (one identical copy
//! per device) or [`Sharded`] (one distinct piece per device), and [`DeviceMesh::pmap`] runs a
//! closure once per device with that device's pieces, returning the results in device order.

use std::{fmt::Display, sync::Arc};

use rayon::{
    iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator},
    ThreadPool, ThreadPoolBuilder,
};
use thiserror::Error;
use tracing::info;

/// Overrides the detected device count.
pub const DEVICES_ENV_VAR: &str = "DALLE_RS_DEVICES";

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("A device mesh needs at least one device.")]
    NoDevices,
    #[error("Expected one shard per device ({devices}), got {shards}.")]
    ShardCountMismatch { devices: usize, shards: usize },
    #[error("Cannot evenly shard {len} elements over {devices} devices.")]
    UnevenShard { len: usize, devices: usize },
    #[error("Invalid value `{value}` for DALLE_RS_DEVICES.")]
    InvalidDeviceCount { value: String },
    #[error("Failed to build the device thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Device {
    ordinal: usize,
}

impl Device {
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }
}

impl Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cpu:{}", self.ordinal)
    }
}

/// One value per device, all identical.
///
/// Host memory is shared, so every replica aliases the same allocation.
#[derive(Debug)]
pub struct Replicated<T> {
    replicas: Vec<Arc<T>>,
}

impl<T> Clone for Replicated<T> {
    fn clone(&self) -> Self {
        Self {
            replicas: self.replicas.clone(),
        }
    }
}

impl<T> Replicated<T> {
    pub fn get(&self, device: usize) -> Option<&T> {
        self.replicas.get(device).map(|x| x.as_ref())
    }

    pub fn device_count(&self) -> usize {
        self.replicas.len()
    }
}

/// One value per device, in device order.
#[derive(Debug, Clone, PartialEq)]
pub struct Sharded<T> {
    shards: Vec<T>,
}

impl<T> Sharded<T> {
    pub fn shards(&self) -> &[T] {
        &self.shards
    }

    pub fn into_shards(self) -> Vec<T> {
        self.shards
    }

    pub fn device_count(&self) -> usize {
        self.shards.len()
    }
}

impl<T> Sharded<Vec<T>> {
    /// Concatenate the shards back into one list, device-major.
    pub fn flatten(self) -> Vec<T> {
        self.shards.into_iter().flatten().collect()
    }
}

pub struct DeviceMesh {
    devices: Vec<Device>,
    pool: Arc<ThreadPool>,
}

impl Clone for DeviceMesh {
    fn clone(&self) -> Self {
        Self {
            devices: self.devices.clone(),
            pool: self.pool.clone(),
        }
    }
}

impl std::fmt::Debug for DeviceMesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMesh")
            .field("devices", &self.devices)
            .finish()
    }
}

impl DeviceMesh {
    /// Create a mesh with `count` devices.
    pub fn new(count: usize) -> Result<Self, MeshError> {
        if count == 0 {
            return Err(MeshError::NoDevices);
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(count)
            .thread_name(|i| format!("dalle-rs-device-{i}"))
            .build()?;
        Ok(Self {
            devices: (0..count).map(|ordinal| Device { ordinal }).collect(),
            pool: Arc::new(pool),
        })
    }

    /// Create a mesh over all available devices: `DALLE_RS_DEVICES` if set, otherwise one device per
    /// logical CPU.
    pub fn detect() -> Result<Self, MeshError> {
        let count = match std::env::var(DEVICES_ENV_VAR) {
            Ok(value) => value
                .trim()
                .parse::<usize>()
                .map_err(|_| MeshError::InvalidDeviceCount {
                    value: value.clone(),
                })?,
            Err(_) => num_cpus::get(),
        };
        let mesh = Self::new(count)?;
        info!("device mesh has {} device(s).", mesh.device_count());
        Ok(mesh)
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Broadcast a value to every device.
    pub fn replicate<T>(&self, value: T) -> Replicated<T> {
        let value = Arc::new(value);
        Replicated {
            replicas: self.devices.iter().map(|_| value.clone()).collect(),
        }
    }

    /// Split a list into `device_count` contiguous, equally sized shards.
    pub fn shard<T>(&self, values: Vec<T>) -> Result<Sharded<Vec<T>>, MeshError> {
        let devices = self.device_count();
        if values.len() % devices != 0 {
            return Err(MeshError::UnevenShard {
                len: values.len(),
                devices,
            });
        }
        let per_device = values.len() / devices;
        let mut values = values.into_iter();
        let shards = (0..devices)
            .map(|_| values.by_ref().take(per_device).collect::<Vec<_>>())
            .collect();
        Ok(Sharded { shards })
    }

    /// Wrap already split values, one per device.
    pub fn from_shards<T>(&self, shards: Vec<T>) -> Result<Sharded<T>, MeshError> {
        if shards.len() != self.device_count() {
            return Err(MeshError::ShardCountMismatch {
                devices: self.device_count(),
                shards: shards.len(),
            });
        }
        Ok(Sharded { shards })
    }

    /// Run `f` once per device, in parallel, with that device's shard. Results keep device order and
    /// the first error (in device order) is returned.
    pub fn pmap<T, R, F>(&self, shards: Sharded<T>, f: F) -> anyhow::Result<Sharded<R>>
    where
        T: Send,
        R: Send,
        F: Fn(Device, T) -> anyhow::Result<R> + Sync,
    {
        if shards.device_count() != self.device_count() {
            return Err(MeshError::ShardCountMismatch {
                devices: self.device_count(),
                shards: shards.device_count(),
            }
            .into());
        }
        let devices = &self.devices;
        let results: Vec<anyhow::Result<R>> = self.pool.install(|| {
            shards
                .shards
                .into_par_iter()
                .enumerate()
                .map(|(i, shard)| f(devices[i], shard))
                .collect()
        });
        let shards = results.into_iter().collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Sharded { shards })
    }

    /// Check that a replicated value lives on this mesh.
    pub fn check_replicated<T>(&self, value: &Replicated<T>) -> Result<(), MeshError> {
        if value.device_count() != self.device_count() {
            return Err(MeshError::ShardCountMismatch {
                devices: self.device_count(),
                shards: value.device_count(),
            });
        }
        Ok(())
    }
}
