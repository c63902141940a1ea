//! Training: loss, gradient clipping and synchronisation, summaries and the
//! epoch loop.

pub mod grad;
pub mod loss;
pub mod summary;
pub mod sync;
pub mod trainer;

pub use loss::{LossOutput, Tacotron2Loss};
pub use summary::{FileSummaryWriter, LogSummaryWriter, MemorySummaryWriter, SummaryWriter};
pub use sync::{GradientSync, SingleProcess};
pub use trainer::{load_checkpoint, Tacotron2Trainer, TrainerConfig, REQUIRED_HPARAMS};
