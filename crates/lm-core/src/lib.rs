//! # lm-core
//!
//! Базовые типы, трейты и определения ошибок для RustLM.
//!
//! Этот крейт предоставляет фундаментальные абстракции для всех остальных
//! крейтов в workspace:
//!
//! - Общие типы данных (`SamplingParams`, `GenerateOptions`, `Fragment`)
//! - KV-кеш для инкрементального декодирования ([`cache::KvCache`])
//! - Унифицированная обработка ошибок через `LmError`
//! - Trait [`CausalLm`] — единый интерфейс для всех языковых моделей
//! - Trait [`TokenCodec`] — интерфейс токенайзера
//! - Реестр архитектур [`ArchType`]

pub mod cache;
pub mod debug;
pub mod error;
pub mod metal_utils;
pub mod model_files;
pub mod model_registry;
pub mod traits;
pub mod types;

pub use cache::{KvCache, LayerKvCache};
pub use error::{LmError, LmResult};
pub use model_registry::{ArchType, QuantizationType};
pub use traits::{CausalLm, TokenCodec};
pub use types::{
    FinishReason, Fragment, GenerateOptions, GenerationStats, ModelInfo, SamplingParams,
};
