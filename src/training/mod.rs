pub mod parity;

pub use parity::{run_rank, ParityReport, StepLosses};
