//! # tacotron - Tacotron 2 on burn
//!
//! A sequence-to-sequence model that turns symbol sequences into mel
//! spectrograms, together with the masked loss and epoch loop used to train it.
//!
//! ## Architecture Overview
//!
//! 1. **Encoder**: symbol embedding, a stack of convolution blocks and a
//!    bidirectional LSTM producing one memory vector per input symbol.
//!    Optional speaker and style vectors are added to every position.
//!
//! 2. **Decoder**: an autoregressive loop with location-sensitive attention.
//!    Each step consumes the previous frame through a pre-net, emits
//!    `frames_per_step` mel frames and a stop-gate logit per frame.
//!
//! 3. **Post-net**: a convolution stack whose output is added to the decoder
//!    mel as a residual refinement.
//!
//! ## Quick Start
//!
//! ```no_run
//! use burn_ndarray::{NdArray, NdArrayDevice};
//! use tacotron::runtime::{RuntimeParams, TacotronRuntime};
//!
//! let device = NdArrayDevice::default();
//! let mut runtime = TacotronRuntime::<NdArray<f32>>::from_config_path(
//!     "hparams.yaml",
//!     Some(std::path::Path::new("output/ljspeech_9")),
//!     RuntimeParams::default(),
//!     &device,
//! )
//! .unwrap();
//! let results = runtime.synthesize(&[vec![12, 40, 7, 33]], None, None).unwrap();
//! println!("{} frames", results[0].frames);
//! ```
//!
//! ## Configuration
//!
//! Hyperparameters are a flat YAML mapping merged over defaults; see
//! [`HParams`]. Training additionally needs the two manifests and a
//! checkpoint name, see [`train::trainer::TrainerConfig`].

pub mod config;
pub mod data;
pub mod perf;
pub mod runtime;
pub mod train;

// Internal modules - exposed for integration tests but not part of stable API.
#[doc(hidden)]
pub mod model;
#[doc(hidden)]
pub mod modules;
#[doc(hidden)]
pub mod state;

pub use config::{load_config, HParams};
pub use data::{Batch, TextMelCollate, TextMelItem};
pub use model::tacotron2::{ModelOutput, Tacotron2};
pub use runtime::{RuntimeParams, Synthesis, TacotronRuntime};
pub use train::trainer::{Tacotron2Trainer, TrainerConfig};
