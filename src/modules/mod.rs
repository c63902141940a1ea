//! Neural network building blocks for the Tacotron 2 model.
//!
//! Each stage owns its parameters as a burn [`Module`](burn::module::Module);
//! shared helpers for masking, seeded dropout and initialisation live alongside.

pub mod attention;
pub mod decoder;
pub mod dropout;
pub mod encoder;
pub mod layers;
pub mod mask;
pub mod postnet;
pub mod prenet;
