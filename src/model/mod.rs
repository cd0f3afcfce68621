pub mod mlp;

pub use mlp::{MlpParams, ReplicatedModel, ShardedLinearStack, ShardedMlp, ShardedSequential};
