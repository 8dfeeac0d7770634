//! Диспетчеризация по архитектуре модели и жизненный цикл сессий.
//!
//! `LmEngine` — единая точка входа для загрузки и использования любой из
//! поддерживаемых языковых моделей. Реестр `ArchType -> конструктор`
//! закрыт и фиксируется на этапе компиляции feature-гейтами.

use std::path::Path;
use std::sync::{Arc, Mutex};

use candle_core::Device;
use tracing::info;

use lm_core::{
    ArchType, CausalLm, GenerateOptions, LmError, LmResult, ModelInfo, TokenCodec,
};
use lm_generate::{CancelToken, GenerationStream, HfTokenizer};

use crate::prompt;

/// Единый движок генерации, абстрагирующий конкретную модель.
///
/// Инвариант: на один движок — не больше одной активной сессии. Новый
/// промпт отменяет предыдущую сессию и строит новую с чистым KV-кешем.
pub struct LmEngine {
    model: Arc<dyn CausalLm>,
    codec: Arc<dyn TokenCodec>,
    /// Токен отмены текущей активной сессии.
    active: Mutex<Option<CancelToken>>,
}

impl LmEngine {
    /// Загрузить модель по архитектуре и пути к директории.
    ///
    /// # Аргументы
    /// * `arch` — архитектура (Qwen3, Llama).
    /// * `model_dir` — путь к директории с файлами модели.
    /// * `device` — устройство (CPU, Metal, CUDA).
    ///
    /// # Ошибки
    /// Возвращает ошибку, если:
    /// - Архитектура не скомпилирована (feature gate отключен).
    /// - Файлы модели не найдены или повреждены.
    pub fn load(arch: ArchType, model_dir: impl AsRef<Path>, device: &Device) -> LmResult<Self> {
        Self::load_inner(arch, model_dir.as_ref(), device, false)
    }

    /// Загрузить квантованную модель (GGUF).
    pub fn load_quantized(
        arch: ArchType,
        model_dir: impl AsRef<Path>,
        device: &Device,
    ) -> LmResult<Self> {
        Self::load_inner(arch, model_dir.as_ref(), device, true)
    }

    fn load_inner(
        arch: ArchType,
        model_dir: &Path,
        device: &Device,
        quantized: bool,
    ) -> LmResult<Self> {
        info!(
            "LmEngine: загрузка модели {} из {:?} (quantized={})",
            arch, model_dir, quantized
        );

        let model: Arc<dyn CausalLm> = match arch {
            #[cfg(feature = "qwen3")]
            ArchType::Qwen3 => {
                if quantized {
                    Arc::new(model_qwen3::Qwen3Model::load_quantized(model_dir, device)?)
                } else {
                    Arc::new(model_qwen3::Qwen3Model::load(model_dir, device)?)
                }
            }

            #[cfg(not(feature = "qwen3"))]
            ArchType::Qwen3 => {
                return Err(LmError::Model(
                    "Qwen3 не скомпилирован. Включите feature 'qwen3' в lm-engine.".into(),
                ));
            }

            #[cfg(feature = "llama")]
            ArchType::Llama => {
                if quantized {
                    return Err(LmError::Model(
                        "Llama: квантованные модели пока не поддерживаются.".into(),
                    ));
                }
                // Metal safety: проверяем работоспособность GPU перед загрузкой
                // тяжёлой модели.
                if device.is_metal() {
                    lm_core::metal_utils::metal_probe(device)?;
                }
                Arc::new(model_llama::LlamaModel::load(model_dir, device)?)
            }

            #[cfg(not(feature = "llama"))]
            ArchType::Llama => {
                return Err(LmError::Model(
                    "Llama не скомпилирована. Включите feature 'llama' в lm-engine.".into(),
                ));
            }
        };

        let codec: Arc<dyn TokenCodec> = Arc::new(HfTokenizer::from_model_dir(model_dir)?);

        info!(
            "LmEngine: модель '{}' загружена ({})",
            model.model_info().display_name,
            model.model_info().quantization
        );

        Ok(Self::from_parts(model, codec))
    }

    /// Создать движок из уже загруженных модели и токенайзера.
    pub fn from_parts(model: Arc<dyn CausalLm>, codec: Arc<dyn TokenCodec>) -> Self {
        Self {
            model,
            codec,
            active: Mutex::new(None),
        }
    }

    /// Архитектура загруженной модели.
    pub fn arch(&self) -> ArchType {
        self.model.arch()
    }

    /// Метаданные модели.
    pub fn model_info(&self) -> ModelInfo {
        self.model.model_info()
    }

    /// Начать сессию по пользовательскому сообщению: промпт оборачивается
    /// в chat-шаблон архитектуры.
    pub fn start_session(
        &self,
        user_message: &str,
        opts: GenerateOptions,
    ) -> LmResult<GenerationStream> {
        let prompt = prompt::chat_prompt(self.model.arch(), user_message);
        self.start_session_raw(&prompt, opts)
    }

    /// Начать сессию по «сырому» промпту (без chat-шаблона).
    ///
    /// Предыдущая активная сессия отменяется и замещается: её KV-кеш
    /// уничтожается вместе с ней, никакого переиспользования.
    pub fn start_session_raw(
        &self,
        prompt: &str,
        opts: GenerateOptions,
    ) -> LmResult<GenerationStream> {
        let prompt_tokens = self.codec.encode(prompt)?;
        if prompt_tokens.is_empty() {
            return Err(LmError::Generation("Пустой промпт".into()));
        }

        let stream = GenerationStream::new(
            self.model.clone(),
            self.codec.clone(),
            prompt_tokens,
            opts,
        );

        let mut active = self.active.lock().expect("session mutex poisoned");
        if let Some(prev) = active.replace(stream.cancel_token()) {
            prev.cancel();
        }
        Ok(stream)
    }

    /// Отменить текущую активную сессию (если есть). Идемпотентно.
    pub fn cancel_active_session(&self) {
        let active = self.active.lock().expect("session mutex poisoned");
        if let Some(token) = active.as_ref() {
            token.cancel();
        }
    }

    /// Список скомпилированных архитектур.
    pub fn available_archs() -> Vec<ArchType> {
        let mut archs = Vec::new();

        #[cfg(feature = "qwen3")]
        archs.push(ArchType::Qwen3);

        #[cfg(feature = "llama")]
        archs.push(ArchType::Llama);

        archs
    }
}
