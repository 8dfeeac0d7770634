//! # lm-engine
//!
//! Единый фасад для всех языковых моделей в RustLM.
//!
//! `LmEngine` позволяет загружать любую поддерживаемую архитектуру через
//! единый интерфейс и вести сессии потоковой генерации, не привязываясь
//! к конкретной реализации. `EngineSlot` добавляет идемпотентную загрузку:
//! конкурентные запросы схлопываются в одну инициализацию.
//!
//! # Пример
//!
//! ```ignore
//! use lm_engine::LmEngine;
//! use lm_core::{ArchType, GenerateOptions};
//!
//! let engine = LmEngine::load(
//!     ArchType::Qwen3,
//!     "models/qwen3-0.6b-instruct",
//!     &candle_core::Device::Cpu,
//! )?;
//!
//! let mut stream = engine.start_session("Привет!", GenerateOptions::default())?;
//! while let Some(fragment) = stream.next_fragment()? {
//!     // текст и статистика по мере готовности
//! }
//! ```

mod engine;
mod loader;
pub mod prompt;

pub use engine::LmEngine;
pub use loader::EngineSlot;
