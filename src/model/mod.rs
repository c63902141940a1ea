//! Model assembly.
//!
//! [`tacotron2::Tacotron2`] wires the building blocks from [`crate::modules`]
//! into the full spectrogram model.

pub mod tacotron2;
