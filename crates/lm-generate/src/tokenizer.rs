//! Обёртка HuggingFace-токенайзера (`tokenizer.json`) под [`TokenCodec`].

use std::path::Path;

use lm_core::{LmError, LmResult, TokenCodec, model_files};

pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    /// Загрузить из файла `tokenizer.json`.
    pub fn from_file(path: impl AsRef<Path>) -> LmResult<Self> {
        let inner = tokenizers::Tokenizer::from_file(path.as_ref()).map_err(|e| {
            LmError::Tokenizer(format!(
                "Не удалось загрузить {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(Self { inner })
    }

    /// Загрузить из директории модели (ожидается `tokenizer.json`).
    pub fn from_model_dir(model_dir: impl AsRef<Path>) -> LmResult<Self> {
        Self::from_file(model_files::resolve_tokenizer_json(model_dir)?)
    }

    /// Id токена по его строковому представлению (спец-токены промпта).
    pub fn token_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }
}

impl TokenCodec for HfTokenizer {
    fn encode(&self, text: &str) -> LmResult<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| LmError::Tokenizer(format!("Ошибка кодирования: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> LmResult<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| LmError::Tokenizer(format!("Ошибка декодирования: {e}")))
    }
}
