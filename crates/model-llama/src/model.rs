//! LlamaModel — сборка модели и адаптер `CausalLm`.

use std::path::Path;

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Embedding, Module, VarBuilder};
use tracing::info;

use lm_core::cache::KvCache;
use lm_core::{ArchType, CausalLm, LmError, LmResult, ModelInfo, QuantizationType, model_files};

use crate::config::LlamaConfig;
use crate::layers::{DecoderLayer, RmsNorm, RotaryEmbedding};

/// Llama decoder-only language model.
#[derive(Debug, Clone)]
pub struct LlamaModel {
    config: LlamaConfig,
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Tensor, // [vocab, hidden]
    device: Device,
    eos_token_ids: Vec<u32>,
    model_name: String,
    weights_size_bytes: Option<u64>,
}

impl LlamaModel {
    /// Create a new Llama model from a VarBuilder rooted at the checkpoint.
    pub fn new(config: LlamaConfig, vb: VarBuilder, device: &Device) -> Result<Self> {
        let model_vb = vb.pp("model");

        let embed_weight = model_vb
            .pp("embed_tokens")
            .get((config.vocab_size, config.hidden_size), "weight")?;
        let embed_tokens = Embedding::new(embed_weight.clone(), config.hidden_size);

        // Общие таблицы cos/sin на все слои.
        let rope = RotaryEmbedding::new(
            config.head_dim(),
            config.max_position_embeddings,
            config.rope_theta,
            device,
        )?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            let layer = DecoderLayer::new(
                &config,
                model_vb.pp(format!("layers.{}", i)),
                rope.clone(),
            )?;
            layers.push(layer);
        }

        let norm = RmsNorm::new(config.hidden_size, config.rms_norm_eps, model_vb.pp("norm"))?;

        let lm_head = if config.tie_word_embeddings {
            embed_weight
        } else {
            vb.pp("lm_head")
                .get((config.vocab_size, config.hidden_size), "weight")?
        };

        Ok(Self {
            device: device.clone(),
            eos_token_ids: vec![config.eos_token_id],
            config,
            embed_tokens,
            layers,
            norm,
            lm_head,
            model_name: "llama".to_string(),
            weights_size_bytes: None,
        })
    }

    /// Load the model from one or multiple safetensors files (шарды).
    pub fn from_safetensors_files(
        config: LlamaConfig,
        paths: &[&Path],
        device: &Device,
    ) -> Result<Self> {
        let dtype = if device.is_metal() || device.is_cuda() {
            DType::BF16
        } else {
            DType::F32
        };
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
        Self::new(config, vb, device)
    }

    /// Загрузить модель из директории (config.json + safetensors).
    pub fn load(model_dir: impl AsRef<Path>, device: &Device) -> LmResult<Self> {
        let model_dir = model_dir.as_ref();
        info!("Загрузка Llama из {:?}", model_dir);

        let config = LlamaConfig::from_hf_config(model_files::resolve_config_json(model_dir)?)?;

        let files = model_files::resolve_safetensors_files(model_dir)?;
        let refs: Vec<&Path> = files.iter().map(|p| p.as_path()).collect();
        let mut model = Self::from_safetensors_files(config, &refs, device)
            .map_err(|e| LmError::Model(format!("Ошибка загрузки Llama из safetensors: {e}")))?;

        model.model_name = model_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("llama")
            .to_string();
        model.weights_size_bytes = model_files::weights_total_size(model_dir);

        info!("Llama загружена: {}", model.model_name);
        Ok(model)
    }

    fn approx_parameters(config: &LlamaConfig) -> u64 {
        let h = config.hidden_size as u64;
        let hd = config.head_dim() as u64;
        let nh = config.num_attention_heads as u64;
        let nkv = config.num_key_value_heads as u64;
        let inter = config.intermediate_size as u64;
        let vocab = config.vocab_size as u64;

        let attn = h * nh * hd + 2 * h * nkv * hd + nh * hd * h;
        let mlp = 3 * h * inter;
        let per_layer = attn + mlp + 2 * h;

        let embeds = if config.tie_word_embeddings {
            vocab * h
        } else {
            2 * vocab * h
        };
        embeds + config.num_hidden_layers as u64 * per_layer + h
    }

    pub fn config(&self) -> &LlamaConfig {
        &self.config
    }
}

impl CausalLm for LlamaModel {
    fn arch(&self) -> ArchType {
        ArchType::Llama
    }

    fn num_layers(&self) -> usize {
        self.config.num_hidden_layers
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn eos_token_ids(&self) -> &[u32] {
        &self.eos_token_ids
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn model_info(&self) -> ModelInfo {
        let mut info = ModelInfo::new(ArchType::Llama)
            .with_display_name(format!("Llama ({})", self.model_name))
            .with_parameters(Self::approx_parameters(&self.config))
            .with_quantization(QuantizationType::None)
            .with_shape(self.config.vocab_size, self.config.num_hidden_layers);
        if let Some(bytes) = self.weights_size_bytes {
            info = info.with_weights_size(bytes);
        }
        info
    }

    fn forward(&self, input_ids: &Tensor, cache: &mut KvCache) -> LmResult<Tensor> {
        let mut hidden_states = self.embed_tokens.forward(input_ids)?;

        for (i, layer) in self.layers.iter().enumerate() {
            hidden_states = layer.forward(&hidden_states, cache.layer_mut(i))?;
        }

        let hidden_states = self.norm.forward(&hidden_states)?;

        let (b, s, h) = hidden_states.dims3()?;
        let x2 = hidden_states.reshape((b * s, h))?;
        let logits = x2.matmul(&self.lm_head.transpose(0, 1)?)?;
        Ok(logits.reshape((b, s, self.config.vocab_size))?)
    }
}
