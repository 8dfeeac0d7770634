//! Унифицированные трейты для языковых моделей и токенайзеров.
//!
//! Каждая архитектура (Qwen3, Llama) реализует [`CausalLm`], обеспечивая
//! единый интерфейс для prefill/decode через общий KV-кеш. Цикл генерации
//! в `lm-generate` работает только с этими трейтами и ничего не знает о
//! конкретных моделях.

use candle_core::{Device, Tensor};

use crate::cache::KvCache;
use crate::error::LmResult;
use crate::model_registry::ArchType;
use crate::types::ModelInfo;

/// Унифицированный trait каузальной языковой модели.
///
/// # Пример
/// ```ignore
/// let model = Qwen3Model::load("models/qwen3-0.6b-instruct", &device)?;
/// let mut cache = KvCache::new(model.num_layers());
/// let logits = model.forward(&prompt_ids, &mut cache)?;
/// ```
pub trait CausalLm: Send + Sync {
    /// Архитектура для реестра.
    fn arch(&self) -> ArchType;

    /// Количество decoder-слоёв (размер KV-кеша).
    fn num_layers(&self) -> usize;

    /// Размер словаря.
    fn vocab_size(&self) -> usize;

    /// Токены, завершающие генерацию (eos, im_end и т.п.).
    fn eos_token_ids(&self) -> &[u32];

    /// Устройство, на котором живут веса.
    fn device(&self) -> &Device;

    /// Информация о загруженной модели (параметры, размер, квантизация).
    fn model_info(&self) -> ModelInfo;

    /// Forward pass с дозаписью KV-кеша.
    ///
    /// # Аргументы
    /// * `input_ids` — токены ТОЛЬКО новых позиций, shape `[batch, seq]`:
    ///   весь промпт при prefill либо один токен на decode-шаге.
    /// * `cache` — KV-кеш текущей сессии; каждый слой дописывает в него
    ///   ровно `seq` позиций. Позиции rotary-эмбеддингов отсчитываются от
    ///   текущего `offset` кеша.
    ///
    /// # Returns
    /// Логиты `[batch, seq, vocab_size]`.
    fn forward(&self, input_ids: &Tensor, cache: &mut KvCache) -> LmResult<Tensor>;
}

/// Токенайзер: внешний коллаборатор цикла генерации.
pub trait TokenCodec: Send + Sync {
    /// Кодирование текста в последовательность id.
    fn encode(&self, text: &str) -> LmResult<Vec<u32>>;

    /// Декодирование последовательности id в текст.
    fn decode(&self, ids: &[u32]) -> LmResult<String>;
}
