//! Интеграционные тесты цикла генерации на фиктивной модели.
//!
//! Вместо настоящих весов — скриптованная `CausalLm`, которая честно
//! дописывает KV-кеш и отдаёт пикованные логиты по заданному сценарию.
//! Часы ручные, поэтому тесты проверяют троттлинг без реального ожидания.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use candle_core::{Device, Tensor};
use lm_core::cache::KvCache;
use lm_core::{
    ArchType, CausalLm, FinishReason, Fragment, GenerateOptions, LmError, LmResult, ModelInfo,
    SamplingParams, TokenCodec,
};
use lm_generate::{GenerationStream, ManualClock};

const VOCAB: usize = 16;
const EOS: u32 = 15;
const NUM_LAYERS: usize = 2;

/// Скриптованная модель: на i-м forward-вызове логиты пикованы на
/// `script[i]` (после конца скрипта — на EOS). Каждый вызов честно
/// дописывает KV-кеш всех слоёв и ведёт учёт вызовов и offset'ов.
struct ScriptedLm {
    script: Vec<u32>,
    eos: Vec<u32>,
    device: Device,
    calls: AtomicUsize,
    offsets_after_call: Mutex<Vec<usize>>,
    clock: Option<ManualClock>,
    advance_per_call: Duration,
    fail_at_call: Option<usize>,
}

impl ScriptedLm {
    fn new(script: Vec<u32>) -> Self {
        Self {
            script,
            eos: vec![EOS],
            device: Device::Cpu,
            calls: AtomicUsize::new(0),
            offsets_after_call: Mutex::new(Vec::new()),
            clock: None,
            advance_per_call: Duration::ZERO,
            fail_at_call: None,
        }
    }

    fn with_clock(mut self, clock: ManualClock, advance_per_call: Duration) -> Self {
        self.clock = Some(clock);
        self.advance_per_call = advance_per_call;
        self
    }

    fn with_failure_at(mut self, call: usize) -> Self {
        self.fail_at_call = Some(call);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn offsets(&self) -> Vec<usize> {
        self.offsets_after_call.lock().unwrap().clone()
    }
}

impl CausalLm for ScriptedLm {
    fn arch(&self) -> ArchType {
        ArchType::Qwen3
    }

    fn num_layers(&self) -> usize {
        NUM_LAYERS
    }

    fn vocab_size(&self) -> usize {
        VOCAB
    }

    fn eos_token_ids(&self) -> &[u32] {
        &self.eos
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo::new(ArchType::Qwen3).with_shape(VOCAB, NUM_LAYERS)
    }

    fn forward(&self, input_ids: &Tensor, cache: &mut KvCache) -> LmResult<Tensor> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_at_call == Some(call) {
            return Err(LmError::Generation("device error (scripted)".into()));
        }
        if let Some(clock) = &self.clock {
            clock.advance(self.advance_per_call);
        }

        let (_batch, seq) = input_ids.dims2()?;

        // Честная дозапись кеша: по `seq` позиций в каждый слой.
        for i in 0..NUM_LAYERS {
            let k = Tensor::zeros((1, 1, seq, 1), candle_core::DType::F32, &self.device)?;
            let v = k.clone();
            cache.layer_mut(i).update(&k, &v)?;
        }
        self.offsets_after_call.lock().unwrap().push(cache.offset());

        let target = self
            .script
            .get(call)
            .copied()
            .unwrap_or(EOS)
            .min(VOCAB as u32 - 1);

        let mut values = vec![0.0f32; seq * VOCAB];
        for pos in 0..seq {
            values[pos * VOCAB + target as usize] = 5.0;
        }
        Ok(Tensor::from_vec(values, (1, seq, VOCAB), &self.device)?)
    }
}

/// Игрушечный кодек: токен i — латинская буква ('a' + i).
struct ToyCodec;

impl TokenCodec for ToyCodec {
    fn encode(&self, text: &str) -> LmResult<Vec<u32>> {
        Ok(text.chars().map(|c| c as u32 - 'a' as u32).collect())
    }

    fn decode(&self, ids: &[u32]) -> LmResult<String> {
        Ok(ids
            .iter()
            .map(|&id| char::from_u32('a' as u32 + id).unwrap())
            .collect())
    }
}

fn greedy_opts(budget: usize) -> GenerateOptions {
    GenerateOptions::default()
        .with_max_new_tokens(budget)
        .with_sampling(SamplingParams::greedy())
}

/// Промпт из 5 токенов — аналог "Hello".
fn prompt() -> Vec<u32> {
    vec![0, 1, 2, 3, 4]
}

fn drain(stream: &mut GenerationStream) -> (String, Vec<Fragment>) {
    let mut text = String::new();
    let mut fragments = Vec::new();
    while let Some(fragment) = stream.next_fragment().unwrap() {
        if let Fragment::Text(t) = &fragment {
            text.push_str(t);
        }
        fragments.push(fragment);
    }
    (text, fragments)
}

#[test]
fn test_budget_scenario_concat_and_cache_offsets() {
    // script: 5 обычных токенов, EOS не встретится до бюджета
    let model = Arc::new(ScriptedLm::new(vec![7, 8, 9, 10, 11, 12]));
    let mut stream = GenerationStream::new(
        model.clone(),
        Arc::new(ToyCodec),
        prompt(),
        greedy_opts(5),
    );

    let (text, fragments) = drain(&mut stream);

    // Склейка фрагментов == полный декод сэмплированной последовательности.
    assert_eq!(text, "hijkl");
    assert_eq!(stream.finish_reason(), Some(FinishReason::MaxTokens));
    assert_eq!(stream.tokens_generated(), 5);

    // 1 prefill + 4 decode-прогона: последний токен бюджета не скармливается.
    assert_eq!(model.calls(), 5);

    // Инвариант кеша: после всех шагов offset = prompt_len + produced - 1.
    let offsets = model.offsets();
    assert_eq!(offsets, vec![5, 6, 7, 8, 9]);
    assert_eq!(*offsets.last().unwrap(), prompt().len() + 5 - 1);

    // Финальный flush непуст и статистика присутствует.
    assert!(fragments.iter().any(|f| matches!(f, Fragment::Text(_))));
    assert!(fragments.iter().any(|f| matches!(f, Fragment::Stats(_))));

    // Повторные опросы после конца потока — стабильный EndOfStream.
    assert!(stream.next_fragment().unwrap().is_none());
}

#[test]
fn test_eos_terminates_without_emitting_eos() {
    // Третий сэмпл — EOS: сгенерировано ровно 2 токена.
    let model = Arc::new(ScriptedLm::new(vec![2, 3, EOS]));
    let mut stream =
        GenerationStream::new(model.clone(), Arc::new(ToyCodec), prompt(), greedy_opts(100));

    let (text, _fragments) = drain(&mut stream);

    assert_eq!(text, "cd");
    assert_eq!(stream.finish_reason(), Some(FinishReason::Eos));
    assert_eq!(stream.tokens_generated(), 2);

    // prefill + 2 feed + ничего после EOS
    assert_eq!(model.calls(), 3);
    assert_eq!(*model.offsets().last().unwrap(), prompt().len() + 2);
}

#[test]
fn test_temperature_zero_is_deterministic_across_sessions() {
    let script = vec![4, 9, 1, 13, 2, 6, 11];
    let run = || {
        let model = Arc::new(ScriptedLm::new(script.clone()));
        let mut stream =
            GenerationStream::new(model, Arc::new(ToyCodec), prompt(), greedy_opts(7));
        drain(&mut stream).0
    };
    assert_eq!(run(), run());
}

#[test]
fn test_same_seed_reproduces_sampled_sequence() {
    let script = vec![4, 9, 1, 13, 2, 6, 11, 3, 5, 8];
    let opts = || {
        GenerateOptions::default()
            .with_max_new_tokens(10)
            .with_sampling(
                SamplingParams::default()
                    .with_temperature(1.0)
                    .with_seed(1234),
            )
    };
    let run = || {
        let model = Arc::new(ScriptedLm::new(script.clone()));
        let mut stream = GenerationStream::new(model, Arc::new(ToyCodec), prompt(), opts());
        drain(&mut stream).0
    };
    assert_eq!(run(), run());
}

#[test]
fn test_throttle_spacing_between_text_fragments() {
    // Каждый forward «длится» 100 мс; интервал эмиссии 250 мс.
    let clock = ManualClock::new();
    let model = Arc::new(
        ScriptedLm::new((0..12).map(|i| (i % 14) as u32).collect())
            .with_clock(clock.clone(), Duration::from_millis(100)),
    );
    let mut stream = GenerationStream::with_clock(
        model,
        Arc::new(ToyCodec),
        prompt(),
        greedy_opts(12),
        Arc::new(clock),
    );

    let (text, fragments) = drain(&mut stream);
    assert_eq!(text.len(), 12);

    // Троттлинг дал больше одного текстового фрагмента, но не 12.
    let text_fragments = fragments
        .iter()
        .filter(|f| matches!(f, Fragment::Text(_)))
        .count();
    assert!(text_fragments > 1, "ожидались промежуточные флаши");
    assert!(text_fragments < 12, "текст не должен эмититься на каждый токен");

    // Каждому текстовому флашу сопутствует статистика; интервалы между
    // промежуточными (не финальными) флашами >= 0.25 c.
    let stats: Vec<f64> = fragments
        .iter()
        .filter_map(|f| match f {
            Fragment::Stats(s) => Some(s.elapsed_secs),
            _ => None,
        })
        .collect();
    for pair in stats.windows(2).take(stats.len().saturating_sub(2)) {
        assert!(
            pair[1] - pair[0] >= 0.25 - 1e-9,
            "флаши ближе минимального интервала: {:?}",
            pair
        );
    }

    // tokens/sec считается по нарастающей и не убывает по токенам.
    let token_counts: Vec<usize> = fragments
        .iter()
        .filter_map(|f| match f {
            Fragment::Stats(s) => Some(s.tokens),
            _ => None,
        })
        .collect();
    assert!(token_counts.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_cancel_mid_generation_flushes_and_stops_model_calls() {
    let model = Arc::new(ScriptedLm::new((0..14).collect()));
    // Нулевой интервал: первый фрагмент приходит после первого же токена,
    // отмена происходит посреди генерации.
    let opts = greedy_opts(100).with_min_emit_interval(Duration::ZERO);
    let mut stream = GenerationStream::new(model.clone(), Arc::new(ToyCodec), prompt(), opts);

    // Отмена из «другой задачи»: токен переживает передачу в поток.
    let token = stream.cancel_token();
    let first = stream.next_fragment().unwrap();
    assert!(first.is_some());
    assert_eq!(stream.tokens_generated(), 1);

    let handle = std::thread::spawn(move || token.cancel());
    handle.join().unwrap();

    let calls_at_cancel_observation;
    let mut tail = String::new();
    loop {
        match stream.next_fragment().unwrap() {
            Some(Fragment::Text(t)) => tail.push_str(&t),
            Some(Fragment::Stats(_)) => {}
            None => {
                calls_at_cancel_observation = model.calls();
                break;
            }
        }
    }

    assert_eq!(stream.finish_reason(), Some(FinishReason::Cancelled));
    // После закрытия потока модель больше не вызывается.
    assert!(stream.next_fragment().unwrap().is_none());
    assert_eq!(model.calls(), calls_at_cancel_observation);
}

#[test]
fn test_cancel_before_first_pull_makes_no_model_calls() {
    let model = Arc::new(ScriptedLm::new((0..10).collect()));
    let mut stream =
        GenerationStream::new(model.clone(), Arc::new(ToyCodec), prompt(), greedy_opts(10));

    stream.cancel();

    assert!(stream.next_fragment().unwrap().is_none());
    assert_eq!(stream.finish_reason(), Some(FinishReason::Cancelled));
    assert_eq!(model.calls(), 0, "prefill не должен выполняться");
    assert_eq!(stream.tokens_generated(), 0);
}

#[test]
fn test_model_failure_flushes_text_then_reports_error_once() {
    // Падение на 4-м forward (prefill=0, feed 1..3): к этому моменту
    // уже сгенерировано 3 токена текста.
    let model = Arc::new(ScriptedLm::new((5..14).collect()).with_failure_at(3));
    let mut stream =
        GenerationStream::new(model.clone(), Arc::new(ToyCodec), prompt(), greedy_opts(100));

    let mut text = String::new();
    let mut saw_error = false;
    loop {
        match stream.next_fragment() {
            Ok(Some(Fragment::Text(t))) => text.push_str(&t),
            Ok(Some(Fragment::Stats(_))) => {}
            Ok(None) => break,
            Err(e) => {
                assert!(matches!(e, LmError::Generation(_)));
                saw_error = true;
            }
        }
    }

    assert!(saw_error, "ошибка модели должна дойти до потребителя");
    // Буфер сброшен до ошибки: три токена fgh.
    assert_eq!(text, "fgh");
    // Повторных ошибок нет: поток закрыт насовсем.
    assert!(stream.next_fragment().unwrap().is_none());
}

#[test]
fn test_empty_prompt_fails_before_any_model_call() {
    let model = Arc::new(ScriptedLm::new(vec![1, 2, 3]));
    let mut stream =
        GenerationStream::new(model.clone(), Arc::new(ToyCodec), Vec::new(), greedy_opts(10));

    let result = stream.next_fragment();
    assert!(result.is_err());
    assert_eq!(model.calls(), 0);
}
