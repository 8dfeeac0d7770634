//! Общие типы для генерации текста.
//!
//! Содержит базовые структуры данных, используемые всеми крейтами workspace:
//! параметры сэмплирования, опции генерации, фрагменты потокового вывода
//! и метаданные моделей.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model_registry::{ArchType, QuantizationType};

// ---------------------------------------------------------------------------
// Параметры сэмплирования
// ---------------------------------------------------------------------------

/// Параметры выбора следующего токена.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Температура (0.0 = детерминированный argmax, > 0 = sampling).
    pub temperature: f32,

    /// Top-k: оставить k наиболее вероятных токенов. `None` — без фильтра.
    pub top_k: Option<usize>,

    /// Nucleus (top-p): минимальное множество токенов с суммарной
    /// вероятностью >= p. `None` — без фильтра.
    pub top_p: Option<f32>,

    /// Seed генератора случайных чисел. `None` — из энтропии ОС,
    /// чтобы повторные генерации давали разный текст.
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: None,
            top_p: None,
            seed: None,
        }
    }
}

impl SamplingParams {
    /// Детерминированный greedy-режим.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Self::default()
        }
    }

    pub fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = Some(k);
        self
    }

    pub fn with_top_p(mut self, p: f32) -> Self {
        self.top_p = Some(p);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

// ---------------------------------------------------------------------------
// Опции генерации
// ---------------------------------------------------------------------------

/// Опции одной сессии генерации.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// Жёсткий лимит новых токенов (бюджет сессии).
    pub max_new_tokens: usize,

    /// Параметры сэмплирования.
    pub sampling: SamplingParams,

    /// Минимальный интервал между эмиссиями текстовых фрагментов.
    ///
    /// Ограничивает частоту обновления UI; текст при этом не теряется —
    /// недоэмиченный остаток буферизуется и принудительно сбрасывается
    /// при завершении потока.
    pub min_emit_interval: Duration,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_new_tokens: 512,
            sampling: SamplingParams::default(),
            min_emit_interval: Duration::from_millis(250),
        }
    }
}

impl GenerateOptions {
    pub fn with_max_new_tokens(mut self, n: usize) -> Self {
        self.max_new_tokens = n;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_min_emit_interval(mut self, interval: Duration) -> Self {
        self.min_emit_interval = interval;
        self
    }
}

// ---------------------------------------------------------------------------
// Потоковый вывод
// ---------------------------------------------------------------------------

/// Единица потокового вывода сессии генерации.
///
/// Текстовые фрагменты, склеенные в порядке эмиссии, в точности
/// восстанавливают полный ответ. Статистика вперемешку с текстом,
/// порядковых гарантий относительно текста не несёт.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    /// Очередной кусок декодированного текста.
    Text(String),
    /// Периодическая статистика производительности.
    Stats(GenerationStats),
}

/// Статистика производительности генерации.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationStats {
    /// Сгенерировано токенов с начала сессии.
    pub tokens: usize,

    /// Время с начала prefill, секунды.
    pub elapsed_secs: f64,

    /// Скорость генерации, токенов в секунду.
    pub tokens_per_sec: f64,
}

impl GenerationStats {
    pub fn new(tokens: usize, elapsed: Duration) -> Self {
        let elapsed_secs = elapsed.as_secs_f64();
        let tokens_per_sec = if elapsed_secs > 0.0 {
            tokens as f64 / elapsed_secs
        } else {
            0.0
        };
        Self {
            tokens,
            elapsed_secs,
            tokens_per_sec,
        }
    }
}

/// Причина нормального завершения сессии.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    /// Модель выдала end-of-sequence токен.
    Eos,
    /// Достигнут лимит `max_new_tokens`.
    MaxTokens,
    /// Вызвавшая сторона запросила отмену.
    Cancelled,
}

// ---------------------------------------------------------------------------
// Метаданные модели
// ---------------------------------------------------------------------------

/// Метаданные загруженной модели.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Архитектура.
    pub arch: ArchType,
    /// Человекочитаемое название.
    pub display_name: String,
    /// Приблизительное количество параметров.
    pub parameters: Option<u64>,
    /// Размер весов в байтах.
    pub weights_size_bytes: Option<u64>,
    /// Тип квантизации.
    pub quantization: QuantizationType,
    /// Размер словаря.
    pub vocab_size: usize,
    /// Количество слоёв.
    pub num_layers: usize,
    /// Бэкенд инференса.
    pub backend: String,
}

impl ModelInfo {
    /// Создать метаданные модели.
    pub fn new(arch: ArchType) -> Self {
        Self {
            display_name: arch.display_name().to_string(),
            backend: arch.backend().to_string(),
            arch,
            parameters: None,
            weights_size_bytes: None,
            quantization: QuantizationType::None,
            vocab_size: 0,
            num_layers: 0,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_parameters(mut self, params: u64) -> Self {
        self.parameters = Some(params);
        self
    }

    pub fn with_weights_size(mut self, bytes: u64) -> Self {
        self.weights_size_bytes = Some(bytes);
        self
    }

    pub fn with_quantization(mut self, q: QuantizationType) -> Self {
        self.quantization = q;
        self
    }

    pub fn with_shape(mut self, vocab_size: usize, num_layers: usize) -> Self {
        self.vocab_size = vocab_size;
        self.num_layers = num_layers;
        self
    }
}
