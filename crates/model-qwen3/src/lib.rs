//! Qwen3 language model crate for text generation.
//!
//! This crate provides the Qwen3 decoder-only transformer,
//! loading safetensors or GGUF weights into candle tensors.

pub mod config;
pub mod layers;
pub mod model;

pub use config::Qwen3Config;
pub use layers::{Attention, DecoderLayer, MLP, RmsNorm, RotaryEmbedding, Weights};
pub use model::Qwen3Model;
