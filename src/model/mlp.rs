//! Small MLP models in sharded and replicated form.
//!
//! Both forms run the same math on the same initial values, so a sharded
//! training run can be checked step by step against a replicated one.

use crate::fsdp::{FullyShard, GroupId, ParamSpec, ShardedModule};
use crate::utils::error::Result;
use candle_core::{Device, Module, Tensor, Var};
use candle_nn::Linear;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{StandardNormal, Uniform};

/// `x W^T + b`
pub fn linear(x: &Tensor, weight: &Tensor, bias: &Tensor) -> candle_core::Result<Tensor> {
    Linear::new(weight.clone(), Some(bias.clone())).forward(x)
}

/// `relu(out_proj(relu(in_proj(x))))`; `p` is `[in_w, in_b, out_w, out_b]`.
pub fn mlp_forward(x: &Tensor, p: &[Tensor]) -> candle_core::Result<Tensor> {
    let z = linear(x, &p[0], &p[1])?.relu()?;
    linear(&z, &p[2], &p[3])?.relu()
}

/// Linear layers with a ReLU between consecutive layers; `p` is `[w0, b0, w1, b1, ..]`.
pub fn linear_stack_forward(x: &Tensor, p: &[Tensor]) -> candle_core::Result<Tensor> {
    let layers = p.len() / 2;
    let mut h = x.clone();
    for (i, pair) in p.chunks(2).enumerate() {
        h = linear(&h, &pair[0], &pair[1])?;
        if i + 1 < layers {
            h = h.relu()?;
        }
    }
    Ok(h)
}

/// Weight `[out, in]` and bias `[out]`, uniform in `±1/sqrt(in)`.
pub fn init_linear(
    rng: &mut StdRng,
    in_dim: usize,
    out_dim: usize,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let bound = 1.0 / (in_dim as f32).sqrt();
    let dist = Uniform::new(-bound, bound);
    let weight: Vec<f32> = (0..in_dim * out_dim).map(|_| rng.sample(dist)).collect();
    let bias: Vec<f32> = (0..out_dim).map(|_| rng.sample(dist)).collect();
    Ok((
        Tensor::from_vec(weight, (out_dim, in_dim), device)?,
        Tensor::from_vec(bias, out_dim, device)?,
    ))
}

/// Standard normal `[rows, cols]` tensor.
pub fn randn(rng: &mut StdRng, rows: usize, cols: usize, device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = (0..rows * cols).map(|_| rng.sample(StandardNormal)).collect();
    Ok(Tensor::from_vec(data, (rows, cols), device)?)
}

/// Initial values of one MLP block.
#[derive(Debug, Clone)]
pub struct MlpParams {
    pub in_w: Tensor,
    pub in_b: Tensor,
    pub out_w: Tensor,
    pub out_b: Tensor,
}

impl MlpParams {
    /// `dim -> dim * multiplier -> dim`
    pub fn init(rng: &mut StdRng, dim: usize, multiplier: usize, device: &Device) -> Result<Self> {
        let hidden = dim * multiplier;
        let (in_w, in_b) = init_linear(rng, dim, hidden, device)?;
        let (out_w, out_b) = init_linear(rng, hidden, dim, device)?;
        Ok(Self { in_w, in_b, out_w, out_b })
    }

    pub fn tensors(&self) -> Vec<Tensor> {
        vec![
            self.in_w.clone(),
            self.in_b.clone(),
            self.out_w.clone(),
            self.out_b.clone(),
        ]
    }

    pub fn specs(&self) -> Vec<ParamSpec> {
        ["in_proj.weight", "in_proj.bias", "out_proj.weight", "out_proj.bias"]
            .into_iter()
            .zip(self.tensors())
            .map(|(name, t)| ParamSpec::new(name, t))
            .collect()
    }
}

/// One MLP block owning one parameter group.
pub struct ShardedMlp {
    group: GroupId,
}

impl ShardedMlp {
    pub fn register(
        fsdp: &mut FullyShard,
        name: &str,
        params: &MlpParams,
        parent: Option<GroupId>,
    ) -> Result<Self> {
        let group = fsdp.register_group(name, params.specs(), parent)?;
        Ok(Self { group })
    }
}

impl ShardedModule for ShardedMlp {
    type Input = Tensor;

    fn group(&self) -> GroupId {
        self.group
    }

    fn forward(&self, fsdp: &mut FullyShard, x: Tensor) -> Result<Tensor> {
        let p = fsdp.params(self.group)?;
        Ok(mlp_forward(&x, &p)?)
    }
}

/// MLP blocks run in order, each its own group under a parameterless root group.
pub struct ShardedSequential {
    group: GroupId,
    layers: Vec<ShardedMlp>,
}

impl ShardedSequential {
    pub fn register(fsdp: &mut FullyShard, blocks: &[MlpParams]) -> Result<Self> {
        let group = fsdp.register_group("root", Vec::new(), None)?;
        let layers = blocks
            .iter()
            .enumerate()
            .map(|(i, p)| ShardedMlp::register(fsdp, &format!("layers.{}", i), p, Some(group)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { group, layers })
    }

    pub fn layers(&self) -> &[ShardedMlp] {
        &self.layers
    }
}

impl ShardedModule for ShardedSequential {
    type Input = Tensor;

    fn group(&self) -> GroupId {
        self.group
    }

    fn forward(&self, fsdp: &mut FullyShard, x: Tensor) -> Result<Tensor> {
        let mut h = x;
        for layer in &self.layers {
            h = fsdp.forward(layer, h)?;
        }
        Ok(h)
    }
}

/// Linear/ReLU stack whose parameters all live in a single group.
pub struct ShardedLinearStack {
    group: GroupId,
}

impl ShardedLinearStack {
    pub fn register(fsdp: &mut FullyShard, layers: &[(Tensor, Tensor)]) -> Result<Self> {
        let specs = layers
            .iter()
            .enumerate()
            .flat_map(|(i, (w, b))| {
                [
                    ParamSpec::new(format!("{}.weight", 2 * i), w.clone()),
                    ParamSpec::new(format!("{}.bias", 2 * i), b.clone()),
                ]
            })
            .collect();
        let group = fsdp.register_group("stack", specs, None)?;
        Ok(Self { group })
    }
}

impl ShardedModule for ShardedLinearStack {
    type Input = Tensor;

    fn group(&self) -> GroupId {
        self.group
    }

    fn forward(&self, fsdp: &mut FullyShard, x: Tensor) -> Result<Tensor> {
        let p = fsdp.params(self.group)?;
        Ok(linear_stack_forward(&x, &p)?)
    }
}

/// Fully replicated counterpart: every rank holds every parameter.
pub struct ReplicatedModel {
    blocks: Vec<Vec<Var>>,
    forward_block: fn(&Tensor, &[Tensor]) -> candle_core::Result<Tensor>,
}

impl ReplicatedModel {
    /// Replica of `ShardedSequential`.
    pub fn mlp_stack(blocks: &[MlpParams]) -> Result<Self> {
        let blocks = blocks
            .iter()
            .map(|b| b.tensors().iter().map(Var::from_tensor).collect())
            .collect::<candle_core::Result<Vec<Vec<Var>>>>()?;
        Ok(Self {
            blocks,
            forward_block: mlp_forward,
        })
    }

    /// Replica of `ShardedLinearStack`.
    pub fn linear_stack(layers: &[(Tensor, Tensor)]) -> Result<Self> {
        let vars = layers
            .iter()
            .flat_map(|(w, b)| [w, b])
            .map(Var::from_tensor)
            .collect::<candle_core::Result<Vec<Var>>>()?;
        Ok(Self {
            blocks: vec![vars],
            forward_block: linear_stack_forward,
        })
    }

    pub fn vars(&self) -> Vec<Var> {
        self.blocks.iter().flatten().cloned().collect()
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_blocks(x, self.blocks.len())
    }

    /// Run only the first `n` blocks.
    pub fn forward_blocks(&self, x: &Tensor, n: usize) -> Result<Tensor> {
        let mut h = x.clone();
        for block in self.blocks.iter().take(n) {
            let p: Vec<Tensor> = block.iter().map(|v| v.as_tensor().clone()).collect();
            h = (self.forward_block)(&h, &p)?;
        }
        Ok(h)
    }
}
