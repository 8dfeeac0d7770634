//! Llama модель (семейство Llama 2/3) для генерации текста.
//!
//! В отличие от Qwen3 здесь нет QK-norm, а head_dim выводится из
//! hidden_size. Квантованные веса пока не поддерживаются — только
//! safetensors.

pub mod config;
pub mod layers;
pub mod model;

pub use config::LlamaConfig;
pub use model::LlamaModel;
