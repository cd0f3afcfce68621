use super::CollectiveCommunicator;
use candle_core::{Error, Result, Tensor};
use std::sync::{Arc, Barrier, Mutex, MutexGuard};

struct SharedState {
    buffers: Mutex<Vec<Option<Tensor>>>,
    barrier: Barrier,
}

impl SharedState {
    fn lock(&self) -> Result<MutexGuard<'_, Vec<Option<Tensor>>>> {
        self.buffers
            .lock()
            .map_err(|_| Error::Msg("local communicator buffer poisoned".to_string()))
    }
}

/// In-process communicator: every member of the group runs on its own thread
/// and exchanges tensors through a shared slot per rank.
pub struct LocalCommunicator {
    rank: usize,
    world_size: usize,
    shared: Arc<SharedState>,
}

impl LocalCommunicator {
    pub fn new_group(world_size: usize) -> Vec<Self> {
        let shared = Arc::new(SharedState {
            buffers: Mutex::new((0..world_size).map(|_| None).collect()),
            barrier: Barrier::new(world_size),
        });

        (0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                shared: shared.clone(),
            })
            .collect()
    }

    fn publish(&self, tensor: &Tensor) -> Result<()> {
        let mut buffers = self.shared.lock()?;
        buffers[self.rank] = Some(tensor.clone());
        Ok(())
    }

    fn slot(buffers: &[Option<Tensor>], rank: usize) -> Result<&Tensor> {
        buffers[rank]
            .as_ref()
            .ok_or_else(|| Error::Msg(format!("rank {} did not publish a tensor", rank)))
    }
}

impl CollectiveCommunicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor> {
        self.publish(tensor)?;
        self.shared.barrier.wait();

        // Every rank sums in rank order so results agree bit for bit.
        let sum = {
            let buffers = self.shared.lock()?;
            let mut sum = Self::slot(&buffers, 0)?.clone();
            for rank in 1..self.world_size {
                sum = (sum + Self::slot(&buffers, rank)?)?;
            }
            sum
        };

        // Slots may be overwritten by the next collective once all have read.
        self.shared.barrier.wait();

        Ok(sum)
    }

    fn all_gather(&self, tensor: &Tensor) -> Result<Tensor> {
        self.publish(tensor)?;
        self.shared.barrier.wait();

        let gathered = {
            let buffers = self.shared.lock()?;
            let tensors = (0..self.world_size)
                .map(|rank| Self::slot(&buffers, rank))
                .collect::<Result<Vec<_>>>()?;
            Tensor::cat(&tensors, 0)?
        };

        self.shared.barrier.wait();

        Ok(gathered)
    }

    fn broadcast(&self, tensor: &Tensor, root_rank: usize) -> Result<Tensor> {
        if self.rank == root_rank {
            self.publish(tensor)?;
        }

        self.shared.barrier.wait();

        let result = {
            let buffers = self.shared.lock()?;
            Self::slot(&buffers, root_rank)?.clone()
        };

        self.shared.barrier.wait();

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use std::thread;

    fn run_group<F>(world_size: usize, f: F) -> Vec<Vec<f32>>
    where
        F: Fn(&LocalCommunicator) -> Tensor + Send + Sync + Copy + 'static,
    {
        let comms = LocalCommunicator::new_group(world_size);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| thread::spawn(move || f(&comm).to_vec1::<f32>().unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_all_reduce() {
        let results = run_group(4, |comm| {
            let t = Tensor::new(&[1.0f32], &Device::Cpu).unwrap();
            comm.all_reduce(&t).unwrap()
        });
        for val in results {
            assert_eq!(val, vec![4.0]);
        }
    }

    #[test]
    fn test_all_gather_concatenates_in_rank_order() {
        let results = run_group(3, |comm| {
            let r = comm.rank() as f32;
            let t = Tensor::new(&[r, r + 0.5], &Device::Cpu).unwrap();
            comm.all_gather(&t).unwrap()
        });
        for val in results {
            assert_eq!(val, vec![0.0, 0.5, 1.0, 1.5, 2.0, 2.5]);
        }
    }

    #[test]
    fn test_reduce_scatter_keeps_local_chunk() {
        let results = run_group(2, |comm| {
            let t = Tensor::new(&[1.0f32, 2.0, 3.0, 4.0], &Device::Cpu).unwrap();
            comm.reduce_scatter(&t).unwrap()
        });
        assert_eq!(results[0], vec![2.0, 4.0]);
        assert_eq!(results[1], vec![6.0, 8.0]);
    }

    #[test]
    fn test_broadcast_from_root() {
        let results = run_group(2, |comm| {
            let t = Tensor::new(&[comm.rank() as f32 + 7.0], &Device::Cpu).unwrap();
            comm.broadcast(&t, 1).unwrap()
        });
        assert_eq!(results, vec![vec![8.0], vec![8.0]]);
    }

    #[test]
    fn test_reduce_scatter_rejects_uneven_input() {
        let comm = LocalCommunicator::new_group(1).pop().unwrap();
        let t = Tensor::new(&[1.0f32, 2.0, 3.0], &Device::Cpu).unwrap();
        assert!(comm.reduce_scatter(&t).is_ok());

        struct Two(LocalCommunicator);
        impl CollectiveCommunicator for Two {
            fn rank(&self) -> usize {
                0
            }

            fn world_size(&self) -> usize {
                2
            }

            fn all_reduce(&self, t: &Tensor) -> Result<Tensor> {
                self.0.all_reduce(t)
            }

            fn all_gather(&self, t: &Tensor) -> Result<Tensor> {
                self.0.all_gather(t)
            }

            fn broadcast(&self, t: &Tensor, r: usize) -> Result<Tensor> {
                self.0.broadcast(t, r)
            }
        }
        let two = Two(comm);
        assert!(two.reduce_scatter(&t).is_err());
    }
}
