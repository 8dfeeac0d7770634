//! Идемпотентная загрузка движка.
//!
//! Состояние загрузки — явное значение `Unloaded -> Loading -> Loaded`
//! под мьютексом, а не амбиентный флаг: конкурентные запросы на загрузку
//! схлопываются в одну инициализацию, остальные ждут на condvar и
//! получают тот же экземпляр.

use std::sync::{Arc, Condvar, Mutex};

use lm_core::LmResult;

use crate::engine::LmEngine;

enum LoadState {
    Unloaded,
    Loading,
    Loaded(Arc<LmEngine>),
}

/// Слот одного движка с идемпотентной загрузкой.
pub struct EngineSlot {
    state: Mutex<LoadState>,
    ready: Condvar,
}

impl Default for EngineSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoadState::Unloaded),
            ready: Condvar::new(),
        }
    }

    /// Загружен ли движок.
    pub fn is_loaded(&self) -> bool {
        matches!(
            *self.state.lock().expect("load state mutex poisoned"),
            LoadState::Loaded(_)
        )
    }

    /// Вернуть загруженный движок, при необходимости загрузив его через
    /// `load`. Конкурентные вызовы выполняют `load` не более одного раза;
    /// все получают один и тот же `Arc`.
    ///
    /// При ошибке загрузки слот возвращается в `Unloaded` (частично
    /// инициализированного состояния не остаётся), ошибка уходит тому,
    /// кто загружал; ожидавшие делают собственную попытку.
    pub fn get_or_load<F>(&self, load: F) -> LmResult<Arc<LmEngine>>
    where
        F: FnOnce() -> LmResult<LmEngine>,
    {
        let mut state = self.state.lock().expect("load state mutex poisoned");
        loop {
            match &*state {
                LoadState::Loaded(engine) => return Ok(engine.clone()),
                LoadState::Loading => {
                    state = self.ready.wait(state).expect("load state mutex poisoned");
                }
                LoadState::Unloaded => break,
            }
        }

        // Мы — загрузчик. Сам load выполняется без удержания мьютекса.
        *state = LoadState::Loading;
        drop(state);

        let result = load();

        let mut state = self.state.lock().expect("load state mutex poisoned");
        match result {
            Ok(engine) => {
                let engine = Arc::new(engine);
                *state = LoadState::Loaded(engine.clone());
                self.ready.notify_all();
                Ok(engine)
            }
            Err(e) => {
                *state = LoadState::Unloaded;
                self.ready.notify_all();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use candle_core::{Device, Tensor};
    use lm_core::cache::KvCache;
    use lm_core::{
        ArchType, CausalLm, LmError, ModelInfo, TokenCodec,
    };

    struct StubLm {
        device: Device,
        eos: Vec<u32>,
    }

    impl StubLm {
        fn new() -> Self {
            Self {
                device: Device::Cpu,
                eos: vec![0],
            }
        }
    }

    impl CausalLm for StubLm {
        fn arch(&self) -> ArchType {
            ArchType::Qwen3
        }
        fn num_layers(&self) -> usize {
            1
        }
        fn vocab_size(&self) -> usize {
            8
        }
        fn eos_token_ids(&self) -> &[u32] {
            &self.eos
        }
        fn device(&self) -> &Device {
            &self.device
        }
        fn model_info(&self) -> ModelInfo {
            ModelInfo::new(ArchType::Qwen3)
        }
        fn forward(&self, input_ids: &Tensor, _cache: &mut KvCache) -> lm_core::LmResult<Tensor> {
            let (_b, seq) = input_ids.dims2()?;
            Ok(Tensor::zeros((1, seq, 8), candle_core::DType::F32, &self.device)?)
        }
    }

    struct StubCodec;

    impl TokenCodec for StubCodec {
        fn encode(&self, text: &str) -> lm_core::LmResult<Vec<u32>> {
            Ok(text.bytes().map(|b| (b % 8) as u32).collect())
        }
        fn decode(&self, ids: &[u32]) -> lm_core::LmResult<String> {
            Ok(ids.iter().map(|_| 'x').collect())
        }
    }

    fn stub_engine() -> LmEngine {
        LmEngine::from_parts(Arc::new(StubLm::new()), Arc::new(StubCodec))
    }

    #[test]
    fn test_concurrent_load_initializes_once() {
        let slot = Arc::new(EngineSlot::new());
        let loads = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(4));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let slot = slot.clone();
            let loads = loads.clone();
            let barrier = barrier.clone();
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                slot.get_or_load(|| {
                    loads.fetch_add(1, Ordering::SeqCst);
                    // имитация долгой загрузки, чтобы остальные дождались Loading
                    std::thread::sleep(std::time::Duration::from_millis(50));
                    Ok(stub_engine())
                })
                .unwrap()
            }));
        }

        let engines: Vec<Arc<LmEngine>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        // Ровно одна инициализация, все получили один экземпляр.
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        for pair in engines.windows(2) {
            assert!(Arc::ptr_eq(&pair[0], &pair[1]));
        }
        assert!(slot.is_loaded());
    }

    #[test]
    fn test_repeated_load_returns_same_instance() {
        let slot = EngineSlot::new();
        let first = slot.get_or_load(|| Ok(stub_engine())).unwrap();
        let second = slot
            .get_or_load(|| panic!("повторная загрузка не должна выполняться"))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_failed_load_reverts_to_unloaded() {
        let slot = EngineSlot::new();
        let err = slot.get_or_load(|| Err(LmError::Model("нет файлов".into())));
        assert!(err.is_err());
        assert!(!slot.is_loaded());

        // Следующая попытка выполняется заново и может преуспеть.
        let engine = slot.get_or_load(|| Ok(stub_engine()));
        assert!(engine.is_ok());
        assert!(slot.is_loaded());
    }
}
