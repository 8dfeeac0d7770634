//! Сессия потоковой генерации: prefill + decode loop.
//!
//! Сессия невозобновляема и владеет своим KV-кешем эксклюзивно: новый
//! промпт означает новую сессию с новым кешем, никакого частичного
//! продолжения. Поток ленивый — модель работает только пока потребитель
//! тянет фрагменты.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use candle_core::{IndexOp, Tensor};
use tracing::{debug, info};

use lm_core::cache::KvCache;
use lm_core::{
    CausalLm, FinishReason, Fragment, GenerateOptions, GenerationStats, LmError, LmResult,
    TokenCodec,
};

use crate::cancel::CancelToken;
use crate::clock::{Clock, SystemClock};
use crate::detokenizer::StreamDecoder;
use crate::sampler::Sampler;
use crate::throttle::EmitThrottle;

/// Состояние сессии.
///
/// `Idle -> Prefilling -> Decoding -> (Completed | Cancelled | Failed)`;
/// `Decoding` зациклен сам на себя по одному токену. Возврата в
/// `Prefilling` нет — только новая сессия.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Prefilling,
    Decoding,
    Completed,
    Cancelled,
    Failed,
}

/// Pull-based поток фрагментов одной сессии генерации.
pub struct GenerationStream {
    model: Arc<dyn CausalLm>,
    decoder: StreamDecoder,
    opts: GenerateOptions,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
    prompt_tokens: Vec<u32>,
    sampler: Sampler,
    throttle: EmitThrottle,

    state: SessionState,
    cache: Option<KvCache>,
    last_logits: Option<Tensor>,
    produced: usize,
    started_at: Duration,
    queue: VecDeque<Fragment>,
    finish_reason: Option<FinishReason>,
    error: Option<LmError>,
}

impl GenerationStream {
    /// Создать сессию с системными часами.
    pub fn new(
        model: Arc<dyn CausalLm>,
        codec: Arc<dyn TokenCodec>,
        prompt_tokens: Vec<u32>,
        opts: GenerateOptions,
    ) -> Self {
        Self::with_clock(model, codec, prompt_tokens, opts, Arc::new(SystemClock::new()))
    }

    /// Создать сессию с явными часами (тесты используют `ManualClock`).
    pub fn with_clock(
        model: Arc<dyn CausalLm>,
        codec: Arc<dyn TokenCodec>,
        prompt_tokens: Vec<u32>,
        opts: GenerateOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            decoder: StreamDecoder::new(codec),
            sampler: Sampler::new(opts.sampling.clone()),
            throttle: EmitThrottle::new(opts.min_emit_interval, now),
            cancel: CancelToken::new(),
            model,
            opts,
            clock,
            prompt_tokens,
            state: SessionState::Idle,
            cache: None,
            last_logits: None,
            produced: 0,
            started_at: now,
            queue: VecDeque::new(),
            finish_reason: None,
            error: None,
        }
    }

    /// Токен отмены этой сессии; можно передать в другой поток.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Запросить отмену. Идемпотентно.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Сколько новых токенов уже сгенерировано.
    pub fn tokens_generated(&self) -> usize {
        self.produced
    }

    /// Причина завершения; `None`, пока сессия активна или упала с ошибкой.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Следующий фрагмент потока.
    ///
    /// `Ok(None)` — конец потока. Ошибка модели возвращается ровно один
    /// раз ПОСЛЕ уже накопленного текста; дальше поток закрыт.
    pub fn next_fragment(&mut self) -> LmResult<Option<Fragment>> {
        loop {
            if let Some(fragment) = self.queue.pop_front() {
                return Ok(Some(fragment));
            }
            match self.state {
                SessionState::Idle => self.prefill(),
                SessionState::Decoding => self.step(),
                SessionState::Completed | SessionState::Cancelled => return Ok(None),
                SessionState::Failed => {
                    return match self.error.take() {
                        Some(e) => Err(e),
                        None => Ok(None),
                    };
                }
                // Prefilling — транзитное состояние внутри prefill().
                SessionState::Prefilling => {
                    return Err(LmError::Generation(
                        "Повторный вход в prefill невозможен".into(),
                    ));
                }
            }
        }
    }

    /// Prefill: один forward по всему промпту, заполняющий KV-кеш.
    fn prefill(&mut self) {
        // Отмена до первого прогона: модель не трогаем вообще.
        if self.cancel.is_cancelled() {
            self.finish(FinishReason::Cancelled);
            return;
        }

        if self.prompt_tokens.is_empty() {
            self.fail(LmError::Generation("Пустой промпт".into()));
            return;
        }

        self.state = SessionState::Prefilling;
        self.started_at = self.clock.now();

        let mut cache = KvCache::new(self.model.num_layers());
        let result = Tensor::new(self.prompt_tokens.as_slice(), self.model.device())
            .and_then(|t| t.unsqueeze(0))
            .map_err(LmError::from)
            .and_then(|input| self.model.forward(&input, &mut cache));

        match result.and_then(|logits| Self::last_position(&logits)) {
            Ok(last) => {
                debug!(
                    "prefill: {} позиций, cache offset={}",
                    self.prompt_tokens.len(),
                    cache.offset()
                );
                self.last_logits = Some(last);
                self.cache = Some(cache);
                self.state = SessionState::Decoding;
            }
            Err(e) => self.fail(e),
        }
    }

    /// Одна decode-итерация: отмена -> бюджет -> сэмплирование -> EOS ->
    /// детокенизация -> rate-limited эмиссия -> прогон токена через модель.
    fn step(&mut self) {
        if self.cancel.is_cancelled() {
            self.finish(FinishReason::Cancelled);
            return;
        }
        if self.produced >= self.opts.max_new_tokens {
            self.finish(FinishReason::MaxTokens);
            return;
        }

        let Some(logits) = self.last_logits.clone() else {
            self.fail(LmError::Generation(
                "Отсутствуют логиты в состоянии Decoding".into(),
            ));
            return;
        };

        let next = match self.sampler.sample(&logits) {
            Ok(t) => t,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        if self.model.eos_token_ids().contains(&next) {
            self.finish(FinishReason::Eos);
            return;
        }
        self.produced += 1;

        match self.decoder.step(next) {
            Ok(Some(text)) => self.throttle.push(&text),
            Ok(None) => {}
            Err(e) => {
                self.fail(e);
                return;
            }
        }

        let now = self.clock.now();
        if let Some(text) = self.throttle.poll(now) {
            self.queue.push_back(Fragment::Text(text));
            self.queue.push_back(Fragment::Stats(self.stats(now)));
        }

        // Новый токен прогоняется через модель, только если понадобятся
        // ещё логиты: последний токен бюджета не дописывает кеш.
        if self.produced < self.opts.max_new_tokens {
            let Some(cache) = self.cache.as_mut() else {
                self.fail(LmError::Generation("KV-кеш сессии уже уничтожен".into()));
                return;
            };
            let result = Tensor::new(&[next], self.model.device())
                .and_then(|t| t.unsqueeze(0))
                .map_err(LmError::from)
                .and_then(|input| self.model.forward(&input, cache));
            match result.and_then(|logits| Self::last_position(&logits)) {
                Ok(last) => self.last_logits = Some(last),
                Err(e) => self.fail(e),
            }
        }
    }

    /// Логиты последней позиции: `[batch, seq, vocab] -> [vocab]`.
    fn last_position(logits: &Tensor) -> LmResult<Tensor> {
        let last = logits.i((.., logits.dim(1)? - 1, ..))?.squeeze(0)?;
        Ok(last)
    }

    /// Нормальное завершение: финальный сброс буфера, затем терминальное
    /// состояние. Кеш сессии уничтожается.
    fn finish(&mut self, reason: FinishReason) {
        match self.decoder.flush() {
            Ok(Some(tail)) => self.throttle.push(&tail),
            Ok(None) => {}
            Err(e) => {
                self.fail(e);
                return;
            }
        }
        if let Some(text) = self.throttle.flush() {
            self.queue.push_back(Fragment::Text(text));
        }
        if self.produced > 0 {
            let stats = self.stats(self.clock.now());
            self.queue.push_back(Fragment::Stats(stats));
        }

        info!(
            "Сессия завершена: {:?}, {} токенов",
            reason, self.produced
        );
        self.finish_reason = Some(reason);
        self.state = match reason {
            FinishReason::Cancelled => SessionState::Cancelled,
            _ => SessionState::Completed,
        };
        self.teardown();
    }

    /// Ошибка модели/токенайзера: сбросить накопленный текст, закрыть
    /// сессию, отдать ошибку потребителю ровно один раз.
    fn fail(&mut self, err: LmError) {
        if let Ok(Some(tail)) = self.decoder.flush() {
            self.throttle.push(&tail);
        }
        if let Some(text) = self.throttle.flush() {
            self.queue.push_back(Fragment::Text(text));
        }
        self.error = Some(err);
        self.state = SessionState::Failed;
        self.teardown();
    }

    fn teardown(&mut self) {
        self.cache = None;
        self.last_logits = None;
    }

    fn stats(&self, now: Duration) -> GenerationStats {
        GenerationStats::new(self.produced, now.saturating_sub(self.started_at))
    }
}

impl Iterator for GenerationStream {
    type Item = LmResult<Fragment>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_fragment() {
            Ok(Some(fragment)) => Some(Ok(fragment)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
