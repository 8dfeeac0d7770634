//! Потоковая детокенизация.
//!
//! BPE-токен сам по себе не обязан быть валидным UTF-8 (байтовые токены
//! могут резать многобайтовый символ посередине), поэтому декодировать
//! по одному токену нельзя. `StreamDecoder` держит окно недоэмиченных
//! токенов и выдаёт дельту текста, как только её хвост снова становится
//! валидным UTF-8.

use std::sync::Arc;

use lm_core::{LmResult, TokenCodec};

pub struct StreamDecoder {
    codec: Arc<dyn TokenCodec>,
    tokens: Vec<u32>,
    // Окно [prev_index..current_index) — уже эмиченный префикс окна,
    // [current_index..] — токены, чей текст ещё не выдан.
    prev_index: usize,
    current_index: usize,
}

impl StreamDecoder {
    pub fn new(codec: Arc<dyn TokenCodec>) -> Self {
        Self {
            codec,
            tokens: Vec::new(),
            prev_index: 0,
            current_index: 0,
        }
    }

    /// Все токены, прошедшие через декодер (в порядке поступления).
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// Добавить токен; вернуть готовую дельту текста, если она есть.
    pub fn step(&mut self, token: u32) -> LmResult<Option<String>> {
        let prev_text = self
            .codec
            .decode(&self.tokens[self.prev_index..self.current_index])?;
        self.tokens.push(token);
        let text = self.codec.decode(&self.tokens[self.prev_index..])?;

        // Дельта готова, только если текст вырос и не обрывается на
        // replacement char (признак разрезанного UTF-8).
        if text.len() > prev_text.len() && !text.ends_with('\u{FFFD}') {
            let delta = text[prev_text.len()..].to_string();
            self.prev_index = self.current_index;
            self.current_index = self.tokens.len();
            Ok(Some(delta))
        } else {
            Ok(None)
        }
    }

    /// Остаток текста, не выданный через [`Self::step`].
    pub fn flush(&mut self) -> LmResult<Option<String>> {
        let prev_text = self
            .codec
            .decode(&self.tokens[self.prev_index..self.current_index])?;
        let text = self.codec.decode(&self.tokens[self.prev_index..])?;
        self.prev_index = self.tokens.len();
        self.current_index = self.tokens.len();
        if text.len() > prev_text.len() {
            Ok(Some(text[prev_text.len()..].to_string()))
        } else {
            Ok(None)
        }
    }
}
