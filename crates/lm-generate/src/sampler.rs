//! Выбор следующего токена: greedy + temperature/top-k/nucleus sampling.

use candle_core::{DType, Tensor};
use rand::SeedableRng;
use rand::distributions::Distribution;

use lm_core::{LmError, LmResult, SamplingParams};

/// Сэмплер следующего токена.
///
/// Генератор случайных чисел пересоздаётся на каждую сессию: с явным
/// seed — воспроизводимо, без seed — из энтропии ОС, чтобы повторные
/// генерации по одному промпту давали разный текст.
pub struct Sampler {
    rng: rand::rngs::StdRng,
    params: SamplingParams,
}

impl Sampler {
    pub fn new(params: SamplingParams) -> Self {
        let rng = match params.seed {
            Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
            None => rand::rngs::StdRng::from_entropy(),
        };
        Self { rng, params }
    }

    /// Выбрать следующий токен по логитам формы `[vocab]`.
    ///
    /// Температура 0 — детерминированный argmax. Иначе: top-k фильтр,
    /// затем nucleus (top-p), затем температурное масштабирование,
    /// softmax и взвешенный выбор.
    pub fn sample(&mut self, logits: &Tensor) -> LmResult<u32> {
        if self.params.temperature <= 0.0 {
            let next = logits.argmax(0)?.to_scalar::<u32>()?;
            return Ok(next);
        }

        let mut logits: Vec<f32> = logits.to_dtype(DType::F32)?.to_vec1()?;

        if let Some(k) = self.params.top_k {
            top_k_filter(&mut logits, k);
        }
        if let Some(p) = self.params.top_p {
            top_p_filter(&mut logits, p);
        }

        for l in logits.iter_mut() {
            *l /= self.params.temperature;
        }
        let probs = softmax(&logits);

        let distr = rand::distributions::WeightedIndex::new(&probs)
            .map_err(|e| LmError::Generation(format!("Некорректное распределение токенов: {e}")))?;
        Ok(distr.sample(&mut self.rng) as u32)
    }
}

/// Численно устойчивый softmax.
fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|&e| e / sum).collect()
}

/// Оставить k наибольших логитов, остальные — в -inf.
fn top_k_filter(logits: &mut [f32], k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }
    let mut indices: Vec<usize> = (0..logits.len()).collect();
    indices.sort_by(|&a, &b| logits[b].total_cmp(&logits[a]));
    for &idx in &indices[k..] {
        logits[idx] = f32::NEG_INFINITY;
    }
}

/// Nucleus: оставить минимальный префикс по убыванию вероятности
/// с накопленной массой >= p (как минимум один токен).
fn top_p_filter(logits: &mut [f32], p: f32) {
    if p >= 1.0 {
        return;
    }
    let probs = softmax(logits);
    let mut indices: Vec<usize> = (0..logits.len()).collect();
    indices.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));

    let mut cumulative = 0.0f32;
    let mut cutoff = indices.len();
    for (rank, &idx) in indices.iter().enumerate() {
        cumulative += probs[idx];
        if cumulative >= p {
            cutoff = rank + 1;
            break;
        }
    }
    for &idx in &indices[cutoff..] {
        logits[idx] = f32::NEG_INFINITY;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn logits(values: &[f32]) -> Tensor {
        Tensor::new(values, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_temperature_zero_is_argmax() {
        let mut sampler = Sampler::new(SamplingParams::greedy());
        let token = sampler.sample(&logits(&[1.0, 5.0, 3.0, 2.0])).unwrap();
        assert_eq!(token, 1);
    }

    #[test]
    fn test_top_k_one_is_argmax_at_any_temperature() {
        let mut sampler = Sampler::new(
            SamplingParams::default()
                .with_temperature(1.5)
                .with_top_k(1)
                .with_seed(7),
        );
        for _ in 0..10 {
            let token = sampler.sample(&logits(&[1.0, 2.0, 10.0, 0.5])).unwrap();
            assert_eq!(token, 2);
        }
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let params = SamplingParams::default().with_temperature(1.0).with_seed(42);
        let mut a = Sampler::new(params.clone());
        let mut b = Sampler::new(params);
        let l = logits(&[0.1, 0.2, 0.3, 0.4, 0.5]);
        for _ in 0..20 {
            assert_eq!(a.sample(&l).unwrap(), b.sample(&l).unwrap());
        }
    }

    #[test]
    fn test_top_p_keeps_dominant_token() {
        // Один токен доминирует после softmax — малый p оставляет только его.
        let mut sampler = Sampler::new(
            SamplingParams::default()
                .with_temperature(1.0)
                .with_top_p(0.01)
                .with_seed(0),
        );
        for _ in 0..10 {
            let token = sampler.sample(&logits(&[1.0, 2.0, 10.0])).unwrap();
            assert_eq!(token, 2);
        }
    }

    #[test]
    fn test_top_p_one_keeps_everything() {
        let mut values = vec![0.0f32; 8];
        values[3] = 1.0;
        top_p_filter(&mut values, 1.0);
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_sampled_token_in_vocab_range() {
        let mut sampler = Sampler::new(SamplingParams::default().with_temperature(0.8));
        let l = logits(&[0.25, 0.25, 0.25, 0.25]);
        for _ in 0..50 {
            assert!(sampler.sample(&l).unwrap() < 4);
        }
    }
}
