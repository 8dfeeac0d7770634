//! Реестр поддерживаемых архитектур языковых моделей.
//!
//! Содержит закрытое перечисление архитектур и метаданные о каждой.
//! Диспетчеризация `ArchType -> конструктор модели` выполняется в `lm-engine`
//! статическим `match` (фиксируется на этапе компиляции).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Архитектура языковой модели.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArchType {
    /// Alibaba Qwen3 — GQA + QK-norm, safetensors или GGUF.
    Qwen3,
    /// Meta Llama (2/3 family) — GQA без QK-norm, только safetensors.
    Llama,
}

impl ArchType {
    /// Все поддерживаемые архитектуры.
    pub fn all() -> &'static [ArchType] {
        &[ArchType::Qwen3, ArchType::Llama]
    }

    /// Строковый идентификатор для CLI.
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchType::Qwen3 => "qwen3",
            ArchType::Llama => "llama",
        }
    }

    /// Полное человекочитаемое название.
    pub fn display_name(&self) -> &'static str {
        match self {
            ArchType::Qwen3 => "Qwen3",
            ArchType::Llama => "Llama",
        }
    }

    /// Бэкенд инференса.
    pub fn backend(&self) -> &'static str {
        // Все архитектуры на Candle (чистый Rust)
        "candle"
    }

    /// Парсинг из строки (CLI-совместимо, включая `model_type` из config.json).
    pub fn from_str_loose(s: &str) -> Option<ArchType> {
        match s.to_lowercase().as_str() {
            "qwen3" | "qwen" | "qwen2" | "qwen3-instruct" => Some(ArchType::Qwen3),
            "llama" | "llama2" | "llama3" | "mistral" => Some(ArchType::Llama),
            _ => None,
        }
    }
}

impl fmt::Display for ArchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Формат квантизации весов.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantizationType {
    /// Полные веса (f32/f16/bf16).
    None,
    /// GGUF Q4_0.
    GgufQ4_0,
    /// GGUF Q8_0.
    GgufQ8_0,
    /// GGUF Q6_K.
    GgufQ6K,
}

impl fmt::Display for QuantizationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuantizationType::None => write!(f, "f32/f16"),
            QuantizationType::GgufQ4_0 => write!(f, "GGUF Q4_0"),
            QuantizationType::GgufQ8_0 => write!(f, "GGUF Q8_0"),
            QuantizationType::GgufQ6K => write!(f, "GGUF Q6_K"),
        }
    }
}
