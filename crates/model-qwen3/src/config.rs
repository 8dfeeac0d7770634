//! Configuration for the Qwen3 model.

use serde::{Deserialize, Serialize};
use std::path::Path;

use lm_core::{LmError, LmResult};

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    1_000_000.0
}

fn default_hidden_act() -> String {
    "silu".to_string()
}

fn default_tie_word_embeddings() -> bool {
    true
}

/// Configuration for the Qwen3 decoder-only transformer.
///
/// Читается напрямую из HuggingFace `config.json` (поля верхнего уровня).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Qwen3Config {
    /// Hidden size.
    pub hidden_size: usize,

    /// Number of hidden layers.
    pub num_hidden_layers: usize,

    /// Number of attention heads.
    pub num_attention_heads: usize,

    /// Number of key-value heads (for GQA).
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

    /// RoPE theta.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,

    /// Head dimension.
    pub head_dim: usize,

    /// Hidden activation (usually "silu").
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,

    /// End-of-sequence token (обычно `<|im_end|>` = 151645).
    pub eos_token_id: Option<u32>,

    /// lm_head делит веса с embed_tokens.
    #[serde(default = "default_tie_word_embeddings")]
    pub tie_word_embeddings: bool,
}

impl Default for Qwen3Config {
    fn default() -> Self {
        Self::qwen3_0_6b()
    }
}

impl Qwen3Config {
    /// Configuration for the Qwen3-0.6B model.
    pub fn qwen3_0_6b() -> Self {
        Self {
            hidden_size: 1024,
            num_hidden_layers: 28,
            num_attention_heads: 16,
            num_key_value_heads: 8,
            intermediate_size: 3072,
            vocab_size: 151936,
            max_position_embeddings: 40960,
            rms_norm_eps: 1e-6,
            rope_theta: 1_000_000.0,
            head_dim: 128,
            hidden_act: "silu".to_string(),
            eos_token_id: Some(151645),
            tie_word_embeddings: true,
        }
    }

    /// Parse configuration from a JSON document.
    pub fn from_json_str(json: &str) -> LmResult<Self> {
        let config: Qwen3Config = serde_json::from_str(json)
            .map_err(|e| LmError::Config(format!("Некорректный config.json для Qwen3: {e}")))?;
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
    fn test_parse_minimal_hf_config() {
        let json = r#"{
            "hidden_size": 1024,
            "num_hidden_layers": 28,
            "num_attention_heads": 16,
            "num_key_value_heads": 8,
            "intermediate_size": 3072,
            "vocab_size": 151936,
            "max_position_embeddings": 40960,
            "head_dim": 128,
            "eos_token_id": 151645
        }"#;
        let config = Qwen3Config::from_json_str(json).unwrap();
        assert_eq!(config.hidden_size, 1024);
        assert_eq!(config.num_hidden_layers, 28);
        assert_eq!(config.eos_token_id, Some(151645));
        // значения по умолчанию
        assert_eq!(config.rms_norm_eps, 1e-6);
        assert_eq!(config.hidden_act, "silu");
        assert!(config.tie_word_embeddings);
    }

    #[test]
    fn test_parse_rejects_bad_gqa_split() {
        let json = r#"{
            "hidden_size": 64,
            "num_hidden_layers": 2,
            "num_attention_heads": 5,
            "num_key_value_heads": 2,
            "intermediate_size": 128,
            "vocab_size": 100,
            "max_position_embeddings": 512,
            "head_dim": 16
        }"#;
        assert!(Qwen3Config::from_json_str(json).is_err());
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        assert!(Qwen3Config::from_json_str("{not json").is_err());
    }
}
