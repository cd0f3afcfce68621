//! How one parameter is split across the ranks of a mesh sub-group.
//!
//! A tensor of extent `L` along `shard_dim` is cut into `n` chunks of
//! `ceil(L / n)`; the tail is zero-padded so every rank holds the same
//! shard shape. Concatenating the shards in rank order and dropping the
//! padding gives back the original tensor exactly.

use crate::utils::error::{FsdpError, Result};
use candle_core::Tensor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescriptor {
    full_shape: Vec<usize>,
    shard_dim: usize,
    /// Global ranks that jointly hold the tensor, in shard order
    owning_ranks: Vec<usize>,
    /// Which of `owning_ranks` holds the local shard
    local_index: usize,
}

impl ShardDescriptor {
    pub fn new(
        full_shape: &[usize],
        shard_dim: usize,
        owning_ranks: Vec<usize>,
        local_index: usize,
    ) -> Result<Self> {
        if shard_dim >= full_shape.len() {
            return Err(FsdpError::ShapeMismatch(format!(
                "cannot shard dim {} of a tensor with shape {:?}",
                shard_dim, full_shape
            )));
        }
        if owning_ranks.is_empty() || local_index >= owning_ranks.len() {
            return Err(FsdpError::Config(format!(
                "local index {} outside owning ranks {:?}",
                local_index, owning_ranks
            )));
        }
        Ok(Self {
            full_shape: full_shape.to_vec(),
            shard_dim,
            owning_ranks,
            local_index,
        })
    }

    pub fn full_shape(&self) -> &[usize] {
        &self.full_shape
    }

    pub fn shard_dim(&self) -> usize {
        self.shard_dim
    }

    pub fn owning_ranks(&self) -> &[usize] {
        &self.owning_ranks
    }

    pub fn local_index(&self) -> usize {
        self.local_index
    }

    pub fn num_shards(&self) -> usize {
        self.owning_ranks.len()
    }

    /// Extent of every shard along `shard_dim`, padding included.
    pub fn chunk_len(&self) -> usize {
        self.full_shape[self.shard_dim].div_ceil(self.num_shards())
    }

    pub fn padded_len(&self) -> usize {
        self.chunk_len() * self.num_shards()
    }

    pub fn shard_shape(&self) -> Vec<usize> {
        let mut shape = self.full_shape.clone();
        shape[self.shard_dim] = self.chunk_len();
        shape
    }

    pub fn shard_numel(&self) -> usize {
        self.shard_shape().iter().product()
    }

    pub fn full_numel(&self) -> usize {
        self.full_shape.iter().product()
    }

    /// Rows of real (non-padding) data held by shard `index`.
    pub fn valid_len(&self, index: usize) -> usize {
        let full = self.full_shape[self.shard_dim];
        let start = (index * self.chunk_len()).min(full);
        (start + self.chunk_len()).min(full) - start
    }

    /// Split a full tensor into every rank's shard, in rank order.
    pub fn shard_tensor(&self, full: &Tensor) -> Result<Vec<Tensor>> {
        if full.dims() != self.full_shape.as_slice() {
            return Err(FsdpError::ShapeMismatch(format!(
                "expected full shape {:?}, got {:?}",
                self.full_shape,
                full.dims()
            )));
        }

        let pad = self.padded_len() - self.full_shape[self.shard_dim];
        let padded = if pad > 0 {
            full.pad_with_zeros(self.shard_dim, 0, pad)?
        } else {
            full.clone()
        };

        let chunk = self.chunk_len();
        (0..self.num_shards())
            .map(|i| Ok(padded.narrow(self.shard_dim, i * chunk, chunk)?.contiguous()?))
            .collect()
    }

    /// This rank's shard of a full tensor.
    pub fn local_shard(&self, full: &Tensor) -> Result<Tensor> {
        let mut shards = self.shard_tensor(full)?;
        Ok(shards.swap_remove(self.local_index))
    }

    /// Reassemble the full tensor from one shard per owning rank, in rank order.
    pub fn reconstruct_full(&self, local_shards: &[Tensor]) -> Result<Tensor> {
        if local_shards.len() != self.num_shards() {
            return Err(FsdpError::ShapeMismatch(format!(
                "expected {} shards, got {}",
                self.num_shards(),
                local_shards.len()
            )));
        }

        let expected = self.shard_shape();
        for (rank, shard) in local_shards.iter().enumerate() {
            if shard.dims() != expected.as_slice() {
                return Err(FsdpError::ShapeMismatch(format!(
                    "shard {} has shape {:?}, partition expects {:?}",
                    rank,
                    shard.dims(),
                    expected
                )));
            }
        }

        let padded = if local_shards.len() == 1 {
            local_shards[0].clone()
        } else {
            Tensor::cat(local_shards, self.shard_dim)?
        };
        let full = padded.narrow(self.shard_dim, 0, self.full_shape[self.shard_dim])?;
        Ok(full.contiguous()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn sample(shape: &[usize]) -> Result<Tensor> {
        let numel: usize = shape.iter().product();
        let data: Vec<f32> = (0..numel).map(|i| (i as f32) * 0.37 - 5.0).collect();
        Ok(Tensor::from_vec(data, shape, &Device::Cpu)?)
    }

    fn bits(t: &Tensor) -> Result<Vec<u32>> {
        Ok(t.flatten_all()?.to_vec1::<f32>()?.iter().map(|v| v.to_bits()).collect())
    }

    #[test]
    fn test_round_trip_is_bit_exact() -> Result<()> {
        for shape in [vec![16, 15], vec![7, 15], vec![15, 3], vec![5], vec![2, 3, 4]] {
            for dim in 0..shape.len() {
                for n in 1..=5 {
                    let full = sample(&shape)?;
                    let desc = ShardDescriptor::new(&shape, dim, (0..n).collect(), 0)?;
                    let shards = desc.shard_tensor(&full)?;
                    assert_eq!(shards.len(), n);
                    let rebuilt = desc.reconstruct_full(&shards)?;
                    assert_eq!(rebuilt.dims(), full.dims());
                    assert_eq!(bits(&rebuilt)?, bits(&full)?, "shape {:?} dim {} n {}", shape, dim, n);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_uneven_split_pads_tail() -> Result<()> {
        let desc = ShardDescriptor::new(&[7, 15], 0, vec![0, 1], 1)?;
        assert_eq!(desc.chunk_len(), 4);
        assert_eq!(desc.shard_shape(), vec![4, 15]);
        assert_eq!(desc.valid_len(0), 4);
        assert_eq!(desc.valid_len(1), 3);

        let shard = desc.local_shard(&sample(&[7, 15])?)?;
        let last_row = shard.get(3)?.to_vec1::<f32>()?;
        assert!(last_row.iter().all(|&v| v == 0.0));
        Ok(())
    }

    #[test]
    fn test_more_ranks_than_rows() -> Result<()> {
        let desc = ShardDescriptor::new(&[3], 0, vec![0, 1, 2, 3], 3)?;
        assert_eq!(desc.chunk_len(), 1);
        assert_eq!(desc.valid_len(3), 0);
        let full = sample(&[3])?;
        let rebuilt = desc.reconstruct_full(&desc.shard_tensor(&full)?)?;
        assert_eq!(bits(&rebuilt)?, bits(&full)?);
        Ok(())
    }

    #[test]
    fn test_reconstruct_rejects_bad_shards() -> Result<()> {
        let desc = ShardDescriptor::new(&[8, 4], 0, vec![0, 1], 0)?;
        let good = Tensor::zeros((4, 4), DType::F32, &Device::Cpu)?;
        let bad = Tensor::zeros((3, 4), DType::F32, &Device::Cpu)?;

        assert!(matches!(
            desc.reconstruct_full(&[good.clone(), bad]),
            Err(FsdpError::ShapeMismatch(_))
        ));
        assert!(matches!(
            desc.reconstruct_full(&[good]),
            Err(FsdpError::ShapeMismatch(_))
        ));
        assert!(matches!(
            desc.shard_tensor(&Tensor::zeros((4, 8), DType::F32, &Device::Cpu)?),
            Err(FsdpError::ShapeMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn test_invalid_descriptor() {
        assert!(matches!(
            ShardDescriptor::new(&[4], 1, vec![0], 0),
            Err(FsdpError::ShapeMismatch(_))
        ));
        assert!(ShardDescriptor::new(&[4], 0, vec![0, 1], 2).is_err());
    }
}
