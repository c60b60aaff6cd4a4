#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
//! Stacked generalized regression: a two-stage Gaussian-kernel regression engine that
//! persists its O(R^2) pair set to storage so memory stays at O(R * C).

pub mod augment;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod kernel;
pub mod metrics;
pub mod record;
pub mod stage2;

#[path = "../shared/storage.rs"]
pub mod storage;

pub use config::EngineConfig;
pub use engine::{Engine, EnginePhase, TrainingSummary};
pub use error::{GrnnError, ParseError};
pub use storage::{DirStorage, MemoryStorage, Storage, StorageError};
