//! Neural network layers for the Llama decoder.
//!
//! Та же pre-norm схема, что и у Qwen3, но без QK-norm и без
//! квантованного пути загрузки.

use candle_core::{D, DType, IndexOp, Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};

use lm_core::cache::LayerKvCache;

use crate::config::LlamaConfig;

/// RMS Normalization layer.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get((size,), "weight")?;
        Ok(Self { weight, eps })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // Вычисления в f32, затем каст обратно (HF-совместимо).
        let input_dtype = x.dtype();
        let x_f32 = x.to_dtype(DType::F32)?;
        let variance = x_f32.sqr()?.mean_keepdim(D::Minus1)?;
        let x_normed = x_f32.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        let x_normed = x_normed.to_dtype(input_dtype)?;
        let w = if self.weight.dtype() != input_dtype {
            self.weight.to_dtype(input_dtype)?
        } else {
            self.weight.clone()
        };
        x_normed.broadcast_mul(&w)
    }
}

/// Rotary Position Embedding.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    pub fn new(
        head_dim: usize,
        max_seq_len: usize,
        theta: f64,
        device: &candle_core::Device,
    ) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / (theta.powf(i as f64 / head_dim as f64) as f32))
            .collect();

        let inv_freq = Tensor::new(inv_freq, device)?;
        let positions: Vec<f32> = (0..max_seq_len).map(|i| i as f32).collect();
        let positions = Tensor::new(positions, device)?.unsqueeze(1)?;

        let freqs = positions.matmul(&inv_freq.unsqueeze(0)?)?; // [seq, head_dim/2]
        let emb = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;

        Ok(Self {
            cos: emb.cos()?,
            sin: emb.sin()?,
        })
    }

    /// Применить RoPE со сдвигом `start_pos` (глобальная позиция в сессии).
    pub fn apply(&self, x: &Tensor, start_pos: usize) -> Result<Tensor> {
        let seq_len = x.dim(2)?;
        let x_dtype = x.dtype();

        let cos = self
            .cos
            .i(start_pos..start_pos + seq_len)?
            .to_dtype(x_dtype)?
            .unsqueeze(0)?
            .unsqueeze(0)?;
        let sin = self
            .sin
            .i(start_pos..start_pos + seq_len)?
            .to_dtype(x_dtype)?
            .unsqueeze(0)?
            .unsqueeze(0)?;

        let head_dim = x.dim(3)?;
        let half = head_dim / 2;
        let x1 = x.i((.., .., .., 0..half))?;
        let x2 = x.i((.., .., .., half..head_dim))?;
        let rotated = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;

        x.broadcast_mul(&cos)? + rotated.broadcast_mul(&sin)?
    }
}

/// Grouped Query Attention layer (без QK-norm).
#[derive(Debug, Clone)]
pub struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    rope: RotaryEmbedding,
}

impl Attention {
    pub fn new(config: &LlamaConfig, vb: VarBuilder, rope: RotaryEmbedding) -> Result<Self> {
        let hidden_size = config.hidden_size;
        let num_heads = config.num_attention_heads;
        let num_kv_heads = config.num_key_value_heads;
        let head_dim = config.head_dim();

        let q_proj = candle_nn::linear_no_bias(hidden_size, num_heads * head_dim, vb.pp("q_proj"))?;
        let k_proj =
            candle_nn::linear_no_bias(hidden_size, num_kv_heads * head_dim, vb.pp("k_proj"))?;
        let v_proj =
            candle_nn::linear_no_bias(hidden_size, num_kv_heads * head_dim, vb.pp("v_proj"))?;
        let o_proj = candle_nn::linear_no_bias(num_heads * head_dim, hidden_size, vb.pp("o_proj"))?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads,
            num_kv_heads,
            head_dim,
            rope,
        })
    }

    /// Forward pass с дозаписью KV-кеша слоя.
    pub fn forward(&self, x: &Tensor, cache: &mut LayerKvCache) -> Result<Tensor> {
        let (batch_size, seq_len, _) = x.dims3()?;

        let q = self.q_proj.forward(x)?;
        let k = self.k_proj.forward(x)?;
        let v = self.v_proj.forward(x)?;

        let q = q
            .reshape((batch_size, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((batch_size, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((batch_size, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        // Позиции RoPE — от текущего offset кеша (до дозаписи).
        let start_pos = cache.offset();
        let q = self.rope.apply(&q, start_pos)?;
        let k = self.rope.apply(&k, start_pos)?;

        let use_causal_mask = cache.is_empty() && seq_len > 1;
        let (k, v) = cache.update(&k, &v)?;

        let kv_repeat = self.num_heads / self.num_kv_heads;
        let k = Self::repeat_kv(&k, kv_repeat)?;
        let v = Self::repeat_kv(&v, kv_repeat)?;

        let scale = (self.head_dim as f64).sqrt();
        let attn = (q.matmul(&k.transpose(2, 3)?)? / scale)?;

        let attn = if use_causal_mask {
            let causal_mask = Self::create_causal_mask(seq_len, attn.device(), attn.dtype())?;
            attn.broadcast_add(&causal_mask)?
        } else {
            attn
        };

        let attn_f32 = attn.to_dtype(DType::F32)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn_f32)?.to_dtype(attn.dtype())?;
        let out = attn.matmul(&v)?;

        let out = out.transpose(1, 2)?.contiguous()?;
        let out = out.reshape((batch_size, seq_len, self.num_heads * self.head_dim))?;

        self.o_proj.forward(&out)
    }

    fn create_causal_mask(
        seq_len: usize,
        device: &candle_core::Device,
        dtype: DType,
    ) -> Result<Tensor> {
        let mask: Vec<f32> = (0..seq_len)
            .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
            .collect();

        let mask = Tensor::from_vec(mask, (seq_len, seq_len), device)?;
        mask.unsqueeze(0)?.unsqueeze(0)?.to_dtype(dtype)
    }

    fn repeat_kv(x: &Tensor, n_rep: usize) -> Result<Tensor> {
        if n_rep == 1 {
            return Ok(x.clone());
        }
        let (_b, kv, _s, _d) = x.dims4()?;
        let mut parts: Vec<Tensor> = Vec::with_capacity(kv * n_rep);
        for i in 0..kv {
            let head = x.i((.., i..i + 1, .., ..))?;
            for _ in 0..n_rep {
                parts.push(head.clone());
            }
        }
        let refs: Vec<&Tensor> = parts.iter().collect();
        Tensor::cat(refs.as_slice(), 1)
    }
}

/// SwiGLU MLP layer.
#[derive(Debug, Clone)]
pub struct MLP {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl MLP {
    pub fn new(config: &LlamaConfig, vb: VarBuilder) -> Result<Self> {
        let hidden_size = config.hidden_size;
        let intermediate_size = config.intermediate_size;

        let gate_proj =
            candle_nn::linear_no_bias(hidden_size, intermediate_size, vb.pp("gate_proj"))?;
        let up_proj = candle_nn::linear_no_bias(hidden_size, intermediate_size, vb.pp("up_proj"))?;
        let down_proj =
            candle_nn::linear_no_bias(intermediate_size, hidden_size, vb.pp("down_proj"))?;

        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = self.gate_proj.forward(x)?.silu()?;
        let up = self.up_proj.forward(x)?;
        self.down_proj.forward(&(gate * up)?)
    }
}

/// Transformer decoder layer.
#[derive(Debug, Clone)]
pub struct DecoderLayer {
    self_attn: Attention,
    mlp: MLP,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    pub fn new(config: &LlamaConfig, vb: VarBuilder, rope: RotaryEmbedding) -> Result<Self> {
        let self_attn = Attention::new(config, vb.pp("self_attn"), rope)?;
        let mlp = MLP::new(config, vb.pp("mlp"))?;
        let input_layernorm = RmsNorm::new(
            config.hidden_size,
            config.rms_norm_eps,
            vb.pp("input_layernorm"),
        )?;
        let post_attention_layernorm = RmsNorm::new(
            config.hidden_size,
            config.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;

        Ok(Self {
            self_attn,
            mlp,
            input_layernorm,
            post_attention_layernorm,
        })
    }

    pub fn forward(&self, x: &Tensor, cache: &mut LayerKvCache) -> Result<Tensor> {
        let residual = x;
        let x = self.input_layernorm.forward(x)?;
        let x = self.self_attn.forward(&x, cache)?;
        let x = (residual + x)?;

        let residual = &x;
        let x = self.post_attention_layernorm.forward(&x)?;
        let x = self.mlp.forward(&x)?;
        residual + x
    }
}
