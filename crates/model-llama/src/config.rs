//! Configuration for the Llama model.

use serde::{Deserialize, Serialize};
use std::path::Path;

use lm_core::{LmError, LmResult};

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_eos_token_id() -> u32 {
    2
}

/// Configuration for the Llama decoder-only transformer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlamaConfig {
    /// Hidden size.
    pub hidden_size: usize,

    /// Number of hidden layers.
    pub num_hidden_layers: usize,

    /// Number of attention heads.
    pub num_attention_heads: usize,

    /// Number of key-value heads (for GQA; equals num_attention_heads for MHA).
    pub num_key_value_heads: usize,

    /// Intermediate size for MLP.
    pub intermediate_size: usize,

    /// Vocabulary size.
    pub vocab_size: usize,

    /// Maximum sequence length.
    pub max_position_embeddings: usize,

    /// RMS norm epsilon.
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,

    /// RoPE theta (10_000 для Llama 2, 500_000 для Llama 3).
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,

    /// End-of-sequence token.
    #[serde(default = "default_eos_token_id")]
    pub eos_token_id: u32,

    /// lm_head делит веса с embed_tokens (в базовых Llama — нет).
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

impl LlamaConfig {
    /// Размерность одной головы внимания.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Parse configuration from a JSON document.
    pub fn from_json_str(json: &str) -> LmResult<Self> {
        let config: LlamaConfig = serde_json::from_str(json)
            .map_err(|e| LmError::Config(format!("Некорректный config.json для Llama: {e}")))?;
        if config.hidden_size % config.num_attention_heads != 0 {
            return Err(LmError::Config(format!(
                "hidden_size ({}) не кратно num_attention_heads ({})",
                config.hidden_size, config.num_attention_heads
            )));
        }
        if config.num_attention_heads % config.num_key_value_heads != 0 {
            return Err(LmError::Config(format!(
                "num_attention_heads ({}) не кратно num_key_value_heads ({})",
                config.num_attention_heads, config.num_key_value_heads
            )));
        }
        Ok(config)
    }

    /// Load configuration from HuggingFace config.json.
    pub fn from_hf_config(path: impl AsRef<Path>) -> LmResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            LmError::Config(format!(
                "Не удалось прочитать {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_json_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_llama2_style_config() {
        let json = r#"{
            "hidden_size": 4096,
            "num_hidden_layers": 32,
            "num_attention_heads": 32,
            "num_key_value_heads": 32,
            "intermediate_size": 11008,
            "vocab_size": 32000,
            "max_position_embeddings": 4096
        }"#;
        let config = LlamaConfig::from_json_str(json).unwrap();
        assert_eq!(config.head_dim(), 128);
        assert_eq!(config.eos_token_id, 2);
        assert_eq!(config.rope_theta, 10_000.0);
        assert!(!config.tie_word_embeddings);
    }

    #[test]
    fn test_parse_rejects_indivisible_heads() {
        let json = r#"{
            "hidden_size": 100,
            "num_hidden_layers": 2,
            "num_attention_heads": 3,
            "num_key_value_heads": 3,
            "intermediate_size": 256,
            "vocab_size": 1000,
            "max_position_embeddings": 512
        }"#;
        assert!(LlamaConfig::from_json_str(json).is_err());
    }
}
