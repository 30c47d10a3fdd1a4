//! Execution context and collective communication
//!
//! Every worker runs the same loop over its own data shard. The only
//! cross-worker coordination is through the blocking collectives defined
//! here; the loop never shares memory with other workers directly.

use std::sync::{Arc, Barrier};

use candle_core::Device;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::DeviceKind;
use crate::error::{Error, Result};

/// Blocking collective operations over a fixed group of workers
///
/// All workers of a group must issue the same sequence of calls with
/// buffers of the same length.
pub trait Collective: Send + Sync {
    /// Rank of the calling worker
    fn rank(&self) -> usize;

    /// Number of workers in the group
    fn world_size(&self) -> usize;

    /// Element-wise sum of `values` across workers, written back in place
    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<()>;

    /// Gather every worker's buffer, ordered by rank
    fn all_gather(&self, values: &[f32]) -> Result<Vec<Vec<f32>>>;

    /// Block until every worker reaches this point
    fn barrier(&self) -> Result<()>;
}

/// Collective for a single-process run
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalCollective;

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _values: &mut [f64]) -> Result<()> {
        Ok(())
    }

    fn all_gather(&self, values: &[f32]) -> Result<Vec<Vec<f32>>> {
        Ok(vec![values.to_vec()])
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

struct GroupState {
    world_size: usize,
    barrier: Barrier,
    reduce_slots: Mutex<Vec<Option<Vec<f64>>>>,
    gather_slots: Mutex<Vec<Option<Vec<f32>>>>,
}

/// In-process worker group; one [`ThreadCollective`] per worker thread
pub struct ThreadGroup;

impl ThreadGroup {
    /// Create `world_size` connected collectives, indexed by rank
    pub fn new(world_size: usize) -> Vec<ThreadCollective> {
        let state = Arc::new(GroupState {
            world_size,
            barrier: Barrier::new(world_size),
            reduce_slots: Mutex::new(vec![None; world_size]),
            gather_slots: Mutex::new(vec![None; world_size]),
        });

        (0..world_size)
            .map(|rank| ThreadCollective {
                rank,
                state: Arc::clone(&state),
            })
            .collect()
    }
}

/// Member of a [`ThreadGroup`]
pub struct ThreadCollective {
    rank: usize,
    state: Arc<GroupState>,
}

impl Collective for ThreadCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.state.world_size
    }

    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<()> {
        self.state.reduce_slots.lock()[self.rank] = Some(values.to_vec());
        self.state.barrier.wait();

        let reduced = {
            let slots = self.state.reduce_slots.lock();
            sum_slots(&slots, self.rank, values.len())
        };

        // Slots may only be reused once every peer has read them.
        self.state.barrier.wait();
        values.copy_from_slice(&reduced?);
        Ok(())
    }

    fn all_gather(&self, values: &[f32]) -> Result<Vec<Vec<f32>>> {
        self.state.gather_slots.lock()[self.rank] = Some(values.to_vec());
        self.state.barrier.wait();

        let gathered = {
            let slots = self.state.gather_slots.lock();
            slots
                .iter()
                .enumerate()
                .map(|(peer, slot)| {
                    slot.clone().ok_or_else(|| {
                        Error::collective(format!("rank {} did not contribute to all_gather", peer))
                    })
                })
                .collect::<Result<Vec<_>>>()
        };

        self.state.barrier.wait();
        gathered
    }

    fn barrier(&self) -> Result<()> {
        self.state.barrier.wait();
        Ok(())
    }
}

fn sum_slots(slots: &[Option<Vec<f64>>], rank: usize, len: usize) -> Result<Vec<f64>> {
    let mut out = vec![0.0; len];
    for (peer, slot) in slots.iter().enumerate() {
        let contribution = slot.as_ref().ok_or_else(|| {
            Error::collective(format!("rank {} did not contribute to all_reduce", peer))
        })?;
        if contribution.len() != len {
            return Err(Error::collective(format!(
                "all_reduce length mismatch: rank {} sent {}, rank {} expects {}",
                peer,
                contribution.len(),
                rank,
                len
            )));
        }
        for (acc, x) in out.iter_mut().zip(contribution) {
            *acc += x;
        }
    }
    Ok(out)
}

/// Process-wide distributed state, created once and passed explicitly
#[derive(Clone)]
pub struct ExecutionContext {
    /// Global rank of this worker
    pub rank: usize,
    /// Number of workers
    pub world_size: usize,
    /// Device ordinal on this host
    pub local_rank: usize,
    /// Compute device for this worker
    pub device: Device,
    collective: Arc<dyn Collective>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("local_rank", &self.local_rank)
            .field("device", &self.device)
            .finish()
    }
}

impl ExecutionContext {
    /// Single-process context on the given device
    pub fn single(device: Device) -> Self {
        Self {
            rank: 0,
            world_size: 1,
            local_rank: 0,
            device,
            collective: Arc::new(LocalCollective),
        }
    }

    /// Context backed by an explicit collective
    pub fn with_collective(device: Device, local_rank: usize, collective: Arc<dyn Collective>) -> Self {
        Self {
            rank: collective.rank(),
            world_size: collective.world_size(),
            local_rank,
            device,
            collective,
        }
    }

    /// Build the context from the `RANK` / `WORLD_SIZE` / `LOCAL_RANK` environment
    pub fn from_env(device: DeviceKind) -> Result<Self> {
        let world_size = read_env_usize("WORLD_SIZE")?.unwrap_or(1);
        let local_rank = read_env_usize("LOCAL_RANK")?.unwrap_or(0);

        if world_size > 1 {
            return Err(Error::unsupported(format!(
                "WORLD_SIZE={} requires a multi-process transport; assemble in-process workers with ThreadGroup instead",
                world_size
            )));
        }

        info!("Not using distributed mode");
        let device = device.open(local_rank)?;
        Ok(Self::single(device))
    }

    /// Collective used for cross-worker reductions
    pub fn collective(&self) -> &dyn Collective {
        self.collective.as_ref()
    }

    /// Whether this worker performs the single-writer side effects
    pub fn is_main_process(&self) -> bool {
        self.rank == 0
    }

    /// Whether there is more than one worker
    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }

    /// Mean of a scalar across workers
    pub fn all_reduce_mean(&self, value: f64) -> Result<f64> {
        if self.world_size == 1 {
            return Ok(value);
        }
        let mut buf = [value];
        self.collective.all_reduce_sum(&mut buf)?;
        Ok(buf[0] / self.world_size as f64)
    }

    /// Rank 0's copy of `values`, delivered to every worker
    pub fn broadcast_from_main(&self, values: &[f32]) -> Result<Vec<f32>> {
        if self.world_size == 1 {
            return Ok(values.to_vec());
        }
        let mut gathered = self.collective.all_gather(values)?;
        if gathered.is_empty() {
            return Err(Error::collective("broadcast received no buffers"));
        }
        Ok(gathered.swap_remove(0))
    }

    /// Wait for all work queued on the device
    pub fn synchronize(&self) -> Result<()> {
        self.device.synchronize()?;
        Ok(())
    }
}

fn read_env_usize(key: &str) -> Result<Option<usize>> {
    match std::env::var(key) {
        Ok(raw) => {
            debug!("{}={}", key, raw);
            raw.trim()
                .parse::<usize>()
                .map(Some)
                .map_err(|_| Error::config(format!("{} must be a non-negative integer, got '{}'", key, raw)))
        }
        Err(_) => Ok(None),
    }
}
