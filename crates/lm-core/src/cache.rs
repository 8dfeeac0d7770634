//! KV-кеш для авторегрессивной генерации.
//!
//! Хранит накопленные K/V для каждого слоя в формате
//! `[batch, kv_heads, seq, head_dim]` и явный `offset` — сколько позиций
//! уже записано. Кеш живёт ровно одну сессию генерации: создаётся пустым
//! перед prefill, дописывается по одному шагу на decode-итерацию и
//! уничтожается вместе с сессией. Вытеснения и усечения нет.

use candle_core::{Result, Tensor};

/// Кеш K/V одного слоя внимания.
#[derive(Debug, Clone, Default)]
pub struct LayerKvCache {
    k: Option<Tensor>,
    v: Option<Tensor>,
    offset: usize,
}

impl LayerKvCache {
    /// Сколько позиций уже записано в кеш этого слоя.
    ///
    /// Инвариант: равно seq-длине накопленных K и V тензоров.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Пустой ли кеш (prefill ещё не выполнялся).
    pub fn is_empty(&self) -> bool {
        self.k.is_none()
    }

    /// Дописать новые K/V в конец по seq-оси и вернуть накопленные тензоры.
    ///
    /// `new_k`/`new_v` содержат только новые позиции: весь промпт при
    /// prefill либо ровно одну позицию на decode-шаге.
    ///
    /// # Panics
    /// Несовпадение batch/heads/head_dim с уже сохранёнными тензорами —
    /// это ошибка конфигурации модели, падаем сразу.
    pub fn update(&mut self, new_k: &Tensor, new_v: &Tensor) -> Result<(Tensor, Tensor)> {
        let (nb, nh, ns, nd) = new_k.dims4()?;
        let (vb, vh, vs, vd) = new_v.dims4()?;
        assert_eq!(
            (nb, nh, ns, nd),
            (vb, vh, vs, vd),
            "KV cache: формы K {:?} и V {:?} расходятся",
            new_k.dims(),
            new_v.dims(),
        );

        let (all_k, all_v) = match (&self.k, &self.v) {
            (Some(k), Some(v)) => {
                let (b, h, _, d) = k.dims4()?;
                assert_eq!(
                    (b, h, d),
                    (nb, nh, nd),
                    "KV cache: несовместимая форма дописываемых тензоров {:?} при накопленных {:?}",
                    new_k.dims(),
                    k.dims(),
                );
                (Tensor::cat(&[k, new_k], 2)?, Tensor::cat(&[v, new_v], 2)?)
            }
            _ => (new_k.clone(), new_v.clone()),
        };

        self.offset += ns;
        self.k = Some(all_k.clone());
        self.v = Some(all_v.clone());
        Ok((all_k, all_v))
    }
}

/// KV-кеш всей модели: по одному [`LayerKvCache`] на слой.
#[derive(Debug, Clone)]
pub struct KvCache {
    layers: Vec<LayerKvCache>,
}

impl KvCache {
    /// Создать пустой кеш для модели с `num_layers` слоями.
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: (0..num_layers).map(|_| LayerKvCache::default()).collect(),
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer_mut(&mut self, idx: usize) -> &mut LayerKvCache {
        &mut self.layers[idx]
    }

    pub fn layers(&self) -> &[LayerKvCache] {
        &self.layers
    }

    /// Текущая позиция кеша (offset первого слоя).
    ///
    /// Все слои дописываются синхронно в рамках одного forward-прохода,
    /// поэтому после прохода значения совпадают.
    pub fn offset(&self) -> usize {
        self.layers.first().map(|l| l.offset()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn kv(seq: usize, fill: f32) -> Tensor {
        Tensor::full(fill, (1, 2, seq, 4), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_update_accumulates_and_advances_offset() {
        let mut cache = LayerKvCache::default();
        assert!(cache.is_empty());
        assert_eq!(cache.offset(), 0);

        // prefill: сразу несколько позиций
        let (k, v) = cache.update(&kv(5, 1.0), &kv(5, 1.0)).unwrap();
        assert_eq!(k.dims(), &[1, 2, 5, 4]);
        assert_eq!(v.dims(), &[1, 2, 5, 4]);
        assert_eq!(cache.offset(), 5);

        // decode: по одной позиции
        for step in 0..3 {
            let (k, _v) = cache.update(&kv(1, 2.0), &kv(1, 2.0)).unwrap();
            assert_eq!(k.dims(), &[1, 2, 5 + step + 1, 4]);
        }
        assert_eq!(cache.offset(), 8);
    }

    #[test]
    #[should_panic(expected = "несовместимая форма")]
    fn test_update_panics_on_head_dim_mismatch() {
        let mut cache = LayerKvCache::default();
        cache.update(&kv(2, 0.0), &kv(2, 0.0)).unwrap();

        let bad = Tensor::zeros((1, 2, 1, 8), DType::F32, &Device::Cpu).unwrap();
        let _ = cache.update(&bad, &bad);
    }

    #[test]
    fn test_model_cache_per_layer_independence() {
        let mut cache = KvCache::new(3);
        assert_eq!(cache.num_layers(), 3);
        for i in 0..3 {
            cache.layer_mut(i).update(&kv(4, 0.5), &kv(4, 0.5)).unwrap();
        }
        assert_eq!(cache.offset(), 4);
        assert!(cache.layers().iter().all(|l| l.offset() == 4));
    }
}
