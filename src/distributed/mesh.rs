//! Logical N-dimensional arrangement of ranks.
//!
//! A `DeviceMesh` is built once from the flat rank list and the dimension
//! sizes, then shared (behind an `Arc`) by every parameter group that uses
//! it. Ranks are laid out row-major: the last dimension varies fastest.

use crate::utils::error::{FsdpError, Result};
use std::collections::HashSet;

/// Identifies one sub-group of a mesh: the dimension it spans and the
/// row-major index of the fixed coordinates on the other dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshGroupId {
    pub dim: usize,
    pub index: usize,
}

/// Ranks that vary along one mesh dimension while every other coordinate is fixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshGroup {
    pub id: MeshGroupId,
    /// Ordered by coordinate along `id.dim`
    pub ranks: Vec<usize>,
}

impl MeshGroup {
    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    /// Position of a global rank inside this group
    pub fn local_rank(&self, global_rank: usize) -> Option<usize> {
        self.ranks.iter().position(|&r| r == global_rank)
    }
}

/// Immutable mesh of ranks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMesh {
    ranks: Vec<usize>,
    shape: Vec<usize>,
}

impl DeviceMesh {
    /// Build a mesh; fails with `InvalidMeshShape` when the product of `shape`
    /// differs from the number of ranks.
    pub fn new(ranks: Vec<usize>, shape: Vec<usize>) -> Result<Self> {
        if shape.is_empty() {
            return Err(FsdpError::InvalidMeshShape(
                "mesh needs at least one dimension".to_string(),
            ));
        }
        if shape.iter().any(|&d| d == 0) {
            return Err(FsdpError::InvalidMeshShape(format!(
                "mesh shape {:?} has an empty dimension",
                shape
            )));
        }

        let expected = shape.iter().product::<usize>();
        if ranks.len() != expected {
            return Err(FsdpError::InvalidMeshShape(format!(
                "rank count ({}) doesn't match mesh shape {:?}",
                ranks.len(),
                shape
            )));
        }

        let mut seen = HashSet::new();
        if let Some(dup) = ranks.iter().find(|r| !seen.insert(**r)) {
            return Err(FsdpError::InvalidMeshShape(format!(
                "rank {} appears more than once",
                dup
            )));
        }

        Ok(Self { ranks, shape })
    }

    /// One-dimensional mesh over ranks `0..world_size`.
    pub fn flat(world_size: usize) -> Result<Self> {
        Self::new((0..world_size).collect(), vec![world_size])
    }

    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    /// Mesh coordinates of a global rank.
    pub fn coords(&self, rank: usize) -> Option<Vec<usize>> {
        let mut flat = self.ranks.iter().position(|&r| r == rank)?;
        let mut coords = vec![0; self.ndim()];
        for (d, &extent) in self.shape.iter().enumerate().rev() {
            coords[d] = flat % extent;
            flat /= extent;
        }
        Some(coords)
    }

    fn rank_at(&self, coords: &[usize]) -> usize {
        let flat = coords
            .iter()
            .zip(&self.shape)
            .fold(0, |acc, (&c, &extent)| acc * extent + c);
        self.ranks[flat]
    }

    fn check_dim(&self, dim: usize) -> Result<()> {
        if dim >= self.ndim() {
            return Err(FsdpError::InvalidMeshShape(format!(
                "dimension {} exceeds mesh shape {:?}",
                dim, self.shape
            )));
        }
        Ok(())
    }

    /// The sub-group along `dim` that contains `rank`.
    pub fn sub_group(&self, dim: usize, rank: usize) -> Result<MeshGroup> {
        self.check_dim(dim)?;
        let coords = self.coords(rank).ok_or_else(|| {
            FsdpError::Config(format!("rank {} is not part of the mesh", rank))
        })?;

        let index = coords
            .iter()
            .zip(&self.shape)
            .enumerate()
            .filter(|(d, _)| *d != dim)
            .fold(0, |acc, (_, (&c, &extent))| acc * extent + c);

        let mut member = coords;
        let ranks = (0..self.shape[dim])
            .map(|c| {
                member[dim] = c;
                self.rank_at(&member)
            })
            .collect();

        Ok(MeshGroup {
            id: MeshGroupId { dim, index },
            ranks,
        })
    }

    /// Every sub-group along `dim`, ordered by id.
    pub fn sub_groups(&self, dim: usize) -> Result<Vec<MeshGroup>> {
        self.check_dim(dim)?;
        let mut groups: Vec<MeshGroup> = Vec::new();
        for &rank in &self.ranks {
            let group = self.sub_group(dim, rank)?;
            if !groups.iter().any(|g| g.id == group.id) {
                groups.push(group);
            }
        }
        groups.sort_by_key(|g| g.id.index);
        Ok(groups)
    }
}
