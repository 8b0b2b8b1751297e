//! In-process collectives for tensor parallelism across threads.
//!
//! Each rank thread holds one [`CpuComm`]. All communicators in a group must
//! participate in every collective in the same order. A collective publishes
//! this rank's tensor into a shared slot, waits for every peer, combines the
//! slots in rank order, then waits again before any slot can be reused.

use std::sync::{Arc, Barrier, Mutex};

use grokrs::backend::{Comm, MultiDeviceOps};
use grokrs::tensor::Tensor;
use grokrs::{Error, Result};

use crate::tensor::CpuTensor;
use crate::CpuBackend;

type Slot = Option<(Vec<usize>, Vec<f32>)>;

struct Group {
    barrier: Barrier,
    slots: Mutex<Vec<Slot>>,
}

/// One rank's handle on a thread group.
pub struct CpuComm {
    rank: usize,
    world_size: usize,
    group: Arc<Group>,
}

impl CpuComm {
    /// Create connected communicators for a group of `world_size` ranks,
    /// ordered by rank.
    ///
    /// # Errors
    /// Returns an error if `world_size` is zero.
    pub fn group(world_size: usize) -> Result<Vec<Self>> {
        if world_size == 0 {
            return Err(Error::Comm("group needs at least one rank".into()));
        }
        tracing::debug!(world_size, "creating in-process collective group");
        let group = Arc::new(Group {
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![None; world_size]),
        });
        Ok((0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                group: Arc::clone(&group),
            })
            .collect())
    }

    /// Publish `tensor`, then hand every rank's contribution (in rank order)
    /// to `combine`.
    fn exchange<R>(
        &self,
        tensor: &CpuTensor,
        combine: impl FnOnce(&[Slot]) -> Result<R>,
    ) -> Result<R> {
        let poisoned = |_| Error::Comm("collective state poisoned".into());
        self.group.slots.lock().map_err(poisoned)?[self.rank] =
            Some((tensor.shape().to_vec(), tensor.to_vec()));
        self.group.barrier.wait();
        let result = {
            let slots = self.group.slots.lock().map_err(poisoned)?;
            combine(&slots)
        };
        self.group.barrier.wait();
        result
    }
}

/// Element-wise sum of every slot, added in rank order.
fn sum_slots(slots: &[Slot]) -> Result<(Vec<usize>, Vec<f32>)> {
    let mut iter = slots.iter().map(|s| {
        s.as_ref()
            .ok_or_else(|| Error::Comm("rank missing from collective".into()))
    });
    let (shape, first) = iter
        .next()
        .ok_or_else(|| Error::Comm("empty group".into()))??;
    let mut total = first.clone();
    for slot in iter {
        let (other_shape, data) = slot?;
        if other_shape != shape {
            return Err(Error::shape("all_reduce operand", shape, other_shape));
        }
        for (t, x) in total.iter_mut().zip(data) {
            *t += x;
        }
    }
    Ok((shape.clone(), total))
}

impl Comm<CpuTensor> for CpuComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, tensor: &mut CpuTensor) -> Result<()> {
        if self.world_size == 1 {
            return Ok(());
        }
        let (shape, total) = self.exchange(tensor, sum_slots)?;
        *tensor = CpuTensor::new(&shape, total)?;
        Ok(())
    }

    fn all_gather_last_dim(&self, tensor: &CpuTensor) -> Result<CpuTensor> {
        if self.world_size == 1 {
            return Ok(tensor.clone());
        }
        let (shape, out) = self.exchange(tensor, |slots| {
            let mut parts = Vec::with_capacity(slots.len());
            for slot in slots {
                let (shape, data) = slot
                    .as_ref()
                    .ok_or_else(|| Error::Comm("rank missing from collective".into()))?;
                parts.push((shape, data));
            }
            let (lead, _) = parts[0].0.split_at(parts[0].0.len().saturating_sub(1));
            let rows: usize = lead.iter().product();
            let mut width = 0;
            for (shape, _) in &parts {
                if shape.len() != parts[0].0.len() || !shape.starts_with(lead) {
                    return Err(Error::shape("all_gather operand", parts[0].0, shape));
                }
                width += shape.last().copied().unwrap_or(1);
            }
            let mut out = Vec::with_capacity(rows * width);
            for row in 0..rows {
                for (shape, data) in &parts {
                    let w = shape.last().copied().unwrap_or(1);
                    out.extend_from_slice(&data[row * w..(row + 1) * w]);
                }
            }
            let mut shape = lead.to_vec();
            shape.push(width);
            Ok((shape, out))
        })?;
        CpuTensor::new(&shape, out)
    }

    fn reduce_scatter_last_dim(&self, tensor: &CpuTensor) -> Result<CpuTensor> {
        let width = tensor.last_dim();
        if width % self.world_size != 0 {
            return Err(Error::UnevenShard {
                axis: tensor.ndim().saturating_sub(1),
                len: width,
                shards: self.world_size,
            });
        }
        let mut summed = tensor.clone();
        self.all_reduce_sum(&mut summed)?;
        let part = width / self.world_size;
        <CpuBackend as grokrs::TensorOps>::slice_last_dim(&summed, self.rank * part, part)
    }
}

impl MultiDeviceOps for CpuBackend {
    fn comm_group(world_size: usize) -> Result<Vec<CpuComm>> {
        CpuComm::group(world_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// Run `f` on every rank of a fresh group and collect the results by rank.
    fn on_group<T: Send>(
        world_size: usize,
        f: impl Fn(&CpuComm) -> Result<T> + Sync,
    ) -> Vec<T> {
        let comms = CpuComm::group(world_size).unwrap();
        thread::scope(|s| {
            let handles: Vec<_> = comms
                .iter()
                .map(|comm| {
                    let f = &f;
                    s.spawn(move || f(comm))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap().unwrap())
                .collect()
        })
    }

    #[test]
    fn test_all_reduce_sum() {
        let out = on_group(3, |comm| {
            let r = comm.rank() as f32;
            let mut t = CpuTensor::from_f32(&[2], &[r, 10.0 * r])?;
            comm.all_reduce_sum(&mut t)?;
            Ok(t.to_vec())
        });
        for v in out {
            assert_eq!(v, vec![3.0, 30.0]);
        }
    }

    #[test]
    fn test_all_gather_last_dim() {
        let out = on_group(2, |comm| {
            let r = comm.rank() as f32;
            let t = CpuTensor::from_f32(&[2, 1], &[r, r + 10.0])?;
            comm.all_gather_last_dim(&t)
        });
        for t in out {
            assert_eq!(t.shape(), &[2, 2]);
            assert_eq!(t.as_slice(), &[0.0, 1.0, 10.0, 11.0]);
        }
    }

    #[test]
    fn test_reduce_scatter_last_dim() {
        let out = on_group(2, |comm| {
            let t = CpuTensor::from_f32(&[1, 4], &[1.0, 2.0, 3.0, 4.0])?;
            comm.reduce_scatter_last_dim(&t)
        });
        assert_eq!(out[0].as_slice(), &[2.0, 4.0]);
        assert_eq!(out[1].as_slice(), &[6.0, 8.0]);
    }

    #[test]
    fn test_repeated_collectives_stay_in_step() {
        let out = on_group(4, |comm| {
            let mut total = 0.0;
            for step in 0..20 {
                let mut t = CpuTensor::from_f32(&[1], &[(comm.rank() * step) as f32])?;
                comm.all_reduce_sum(&mut t)?;
                total += t.as_slice()[0];
            }
            Ok(total)
        });
        // sum over steps of step * (0+1+2+3)
        assert!(out.iter().all(|&t| (t - 6.0 * 190.0).abs() < 1e-3));
    }

    #[test]
    fn test_shape_disagreement_fails_everywhere() {
        let comms = CpuComm::group(2).unwrap();
        let errs: Vec<bool> = thread::scope(|s| {
            let handles: Vec<_> = comms
                .iter()
                .map(|comm| {
                    s.spawn(move || {
                        let mut t = CpuTensor::zeros(&[comm.rank() + 1]);
                        comm.all_reduce_sum(&mut t).is_err()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(errs, vec![true, true]);
    }

    #[test]
    fn test_single_rank_is_identity() {
        let comms = CpuComm::group(1).unwrap();
        let t = CpuTensor::from_f32(&[1, 2], &[1.0, 2.0]).unwrap();
        assert_eq!(comms[0].reduce_scatter_last_dim(&t).unwrap().as_slice(), &[1.0, 2.0]);
        assert!(CpuComm::group(0).is_err());
    }
}
