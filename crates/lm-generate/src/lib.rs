//! # lm-generate
//!
//! Цикл потоковой генерации текста поверх любой [`lm_core::CausalLm`].
//!
//! Схема работы:
//! 1. **Prefill** — один forward по всему промпту, заполняющий KV-кеш.
//! 2. **Decode loop** — по одному токену за итерацию: сэмплирование,
//!    инкрементальная детокенизация, буферизация и rate-limited эмиссия
//!    текстовых фрагментов вперемешку со статистикой (токены/сек).
//! 3. **Завершение** — по бюджету, EOS или кооперативной отмене; буфер
//!    всегда принудительно сбрасывается финальным фрагментом.
//!
//! Поток pull-based: потребитель тянет фрагменты через
//! [`GenerationStream::next_fragment`], отмена — через [`CancelToken`]
//! из любого потока.

pub mod cancel;
pub mod clock;
pub mod detokenizer;
pub mod sampler;
pub mod session;
pub mod throttle;
pub mod tokenizer;

pub use cancel::CancelToken;
pub use clock::{Clock, ManualClock, SystemClock};
pub use detokenizer::StreamDecoder;
pub use sampler::Sampler;
pub use session::GenerationStream;
pub use throttle::EmitThrottle;
pub use tokenizer::HfTokenizer;
