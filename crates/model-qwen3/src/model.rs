//! Qwen3 model assembly and the `CausalLm` adapter.

use std::path::Path;

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Embedding, Module, VarBuilder};
use candle_transformers::quantized_var_builder as quantized_vb;
use tracing::info;

use lm_core::cache::KvCache;
use lm_core::{ArchType, CausalLm, LmError, LmResult, ModelInfo, QuantizationType, model_files};

use crate::config::Qwen3Config;
use crate::layers::{DecoderLayer, RmsNorm, RotaryEmbedding, Weights};

/// Токен `<|endoftext|>` — запасной EOS помимо `<|im_end|>` из конфига.
const ENDOFTEXT: u32 = 151643;

/// Qwen3 decoder-only language model.
#[derive(Debug, Clone)]
pub struct Qwen3Model {
    config: Qwen3Config,
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: LmHead,
    device: Device,
    eos_token_ids: Vec<u32>,
    quantization: QuantizationType,
    model_name: String,
    weights_size_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
struct LmHead {
    weight: Tensor, // [vocab, hidden]
}

impl LmHead {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, s, h) = x.dims3()?;
        let x2 = x.reshape((b * s, h))?;
        let w_t = self.weight.transpose(0, 1)?; // [hidden, vocab]
        let y = x2.matmul(&w_t)?;
        y.reshape((b, s, self.weight.dim(0)?))
    }
}

impl Qwen3Model {
    /// Create a new Qwen3 model from weights.
    ///
    /// `lm_head_weight` — отдельный тензор `[vocab, hidden]` для untied
    /// чекпойнтов; `None` означает tied lm_head (веса embed_tokens).
    pub fn new(
        config: Qwen3Config,
        weights: Weights<'_>,
        device: &Device,
        lm_head_weight: Option<Tensor>,
    ) -> Result<Self> {
        let target_dtype = if device.is_metal() || device.is_cuda() {
            DType::BF16
        } else {
            DType::F32
        };

        // embed_tokens.weight
        let embed_weight = match &weights {
            Weights::Standard(vb) => vb
                .pp("embed_tokens")
                .get((config.vocab_size, config.hidden_size), "weight")?,
            Weights::Quantized(vb) => vb
                .pp("embed_tokens")
                .get((config.vocab_size, config.hidden_size), "weight")?
                .dequantize(device)?,
        };

        let embed_weight = if embed_weight.dtype() != target_dtype {
            embed_weight.to_dtype(target_dtype)?
        } else {
            embed_weight
        };

        let embed_tokens = Embedding::new(embed_weight.clone(), config.hidden_size);

        // RoPE одинаковый для всех слоев, поэтому строим таблицы один раз и делимся ими.
        // Это критично по памяти: иначе каждый слой дублирует cos/sin.
        let rope = RotaryEmbedding::new(
            config.head_dim,
            config.max_position_embeddings,
            config.rope_theta,
            device,
        )?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            let layer =
                DecoderLayer::new(&config, weights.pp(format!("layers.{}", i)), rope.clone())?;
            layers.push(layer);
        }

        let norm = RmsNorm::load(config.hidden_size, config.rms_norm_eps, &weights.pp("norm"))?;

        // lm_head: либо tied с embed_tokens, либо отдельный тензор на корне чекпойнта.
        let lm_head = match lm_head_weight {
            Some(weight) => LmHead { weight },
            None => LmHead {
                weight: embed_weight,
            },
        };

        let mut eos_token_ids = vec![config.eos_token_id.unwrap_or(151645)];
        if !eos_token_ids.contains(&ENDOFTEXT) {
            eos_token_ids.push(ENDOFTEXT);
        }

        Ok(Self {
            device: device.clone(),
            eos_token_ids,
            config,
            embed_tokens,
            layers,
            norm,
            lm_head,
            quantization: QuantizationType::None,
            model_name: "qwen3".to_string(),
            weights_size_bytes: None,
        })
    }

    /// Load the model from one or multiple safetensors files (шарды).
    pub fn from_safetensors_files(
        config: Qwen3Config,
        paths: &[&Path],
        device: &Device,
    ) -> Result<Self> {
        // Use F32 for CPU (BF16 not supported for matmul on CPU)
        // Use BF16 for GPU for better performance
        let dtype = if device.is_metal() || device.is_cuda() {
            DType::BF16
        } else {
            DType::F32
        };

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
        let lm_head_weight = if config.tie_word_embeddings {
            None
        } else {
            Some(
                vb.pp("lm_head")
                    .get((config.vocab_size, config.hidden_size), "weight")?,
            )
        };
        Self::new(config, Weights::Standard(vb.pp("model")), device, lm_head_weight)
    }

    /// Load the model from a gguf file.
    pub fn from_gguf(config: Qwen3Config, path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let vb = quantized_vb::VarBuilder::from_gguf(path.as_ref(), device)?;
        let lm_head_weight = if config.tie_word_embeddings {
            None
        } else {
            Some(
                vb.pp("lm_head")
                    .get((config.vocab_size, config.hidden_size), "weight")?
                    .dequantize(device)?,
            )
        };
        Self::new(config, Weights::Quantized(vb.pp("model")), device, lm_head_weight)
    }

    /// Загрузить модель из директории (предпочитая GGUF, если он есть).
    ///
    /// # Аргументы
    /// * `model_dir` — директория с файлами модели:
    ///   - `config.json` (обязательно)
    ///   - `model.safetensors` / шардированные `model-*.safetensors` (веса)
    ///   - `tokenizer.json` (токенайзер, читается выше по стеку)
    ///   - `model-*.gguf` (опционально, квантованные веса)
    /// * `device` — устройство (CPU, Metal, CUDA)
    pub fn load(model_dir: impl AsRef<Path>, device: &Device) -> LmResult<Self> {
        Self::load_inner(model_dir.as_ref(), device, false)
    }

    /// Загрузить квантованную модель (GGUF обязателен).
    pub fn load_quantized(model_dir: impl AsRef<Path>, device: &Device) -> LmResult<Self> {
        Self::load_inner(model_dir.as_ref(), device, true)
    }

    fn load_inner(model_dir: &Path, device: &Device, require_gguf: bool) -> LmResult<Self> {
        info!("Загрузка Qwen3 из {:?}", model_dir);

        let config = Qwen3Config::from_hf_config(model_files::resolve_config_json(model_dir)?)?;

        let gguf = model_files::find_preferred_gguf(model_dir);
        if require_gguf && gguf.is_none() {
            return Err(LmError::Model(
                "GGUF не найден в директории модели (ожидался model-*.gguf)".into(),
            ));
        }

        let mut model = if let Some(gguf_path) = gguf {
            let mut m = Self::from_gguf(config, &gguf_path, device)
                .map_err(|e| LmError::Model(format!("Ошибка загрузки Qwen3 из GGUF: {e}")))?;
            m.quantization = Self::detect_quantization(&gguf_path);
            m
        } else {
            let files = model_files::resolve_safetensors_files(model_dir)?;
            let refs: Vec<&Path> = files.iter().map(|p| p.as_path()).collect();
            Self::from_safetensors_files(config, &refs, device)
                .map_err(|e| LmError::Model(format!("Ошибка загрузки Qwen3 из safetensors: {e}")))?
        };

        // Извлекаем имя модели из имени директории
        model.model_name = model_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("qwen3")
            .to_string();
        model.weights_size_bytes = model_files::weights_total_size(model_dir);

        info!(
            "Qwen3 загружена: {}, квантизация: {}",
            model.model_name, model.quantization
        );

        Ok(model)
    }

    /// Определить тип квантизации по имени GGUF-файла.
    fn detect_quantization(path: &Path) -> QuantizationType {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.contains("q4") {
            QuantizationType::GgufQ4_0
        } else if name.contains("q6k") || name.contains("q6_k") {
            QuantizationType::GgufQ6K
        } else {
            // GGUF есть, но тип не определён — считаем Q8
            QuantizationType::GgufQ8_0
        }
    }

    /// Приблизительное количество параметров по размерам из конфига.
    fn approx_parameters(config: &Qwen3Config) -> u64 {
        let h = config.hidden_size as u64;
        let hd = config.head_dim as u64;
        let nh = config.num_attention_heads as u64;
        let nkv = config.num_key_value_heads as u64;
        let inter = config.intermediate_size as u64;
        let vocab = config.vocab_size as u64;

        let attn = h * nh * hd + 2 * h * nkv * hd + nh * hd * h + 2 * hd;
        let mlp = 3 * h * inter;
        let per_layer = attn + mlp + 2 * h;

        let embeds = if config.tie_word_embeddings {
            vocab * h
        } else {
            2 * vocab * h
        };
        embeds + config.num_hidden_layers as u64 * per_layer + h
    }

    /// Get the configuration.
    pub fn config(&self) -> &Qwen3Config {
        &self.config
    }
}

impl CausalLm for Qwen3Model {
    fn arch(&self) -> ArchType {
        ArchType::Qwen3
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
        let mut info = ModelInfo::new(ArchType::Qwen3)
            .with_display_name(format!("Qwen3 ({})", self.model_name))
            .with_parameters(Self::approx_parameters(&self.config))
            .with_quantization(self.quantization)
            .with_shape(self.config.vocab_size, self.config.num_hidden_layers);
        if let Some(bytes) = self.weights_size_bytes {
            info = info.with_weights_size(bytes);
        }
        info
    }

    /// Forward pass с KV-кешем (prefill + decode).
    ///
    /// - В режиме prefill (кеш пустой) применяет causal mask и заполняет кеш.
    /// - В режиме decode ожидает `input_ids` формы `[batch, 1]` и делает один
    ///   шаг с дозаписью кеша.
    fn forward(&self, input_ids: &Tensor, cache: &mut KvCache) -> LmResult<Tensor> {
        if lm_core::debug::enabled() {
            eprintln!(
                "DEBUG qwen3 forward: input={:?}, cache offset={}",
                input_ids.dims(),
                cache.offset()
            );
        }

        let mut hidden_states = self.embed_tokens.forward(input_ids)?;

        for (i, layer) in self.layers.iter().enumerate() {
            hidden_states = layer.forward(&hidden_states, cache.layer_mut(i))?;
        }

        let hidden_states = self.norm.forward(&hidden_states)?;
        Ok(self.lm_head.forward(&hidden_states)?)
    }
}
