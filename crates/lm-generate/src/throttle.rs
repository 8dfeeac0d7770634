//! Rate-limited буферизация текстовых фрагментов.
//!
//! Маленькая явная state-machine (`buffer`, `last_emit`): текст копится
//! в буфере и эмитится не чаще, чем раз в `min_interval`. Ничего не
//! теряется — остаток сбрасывается принудительным [`EmitThrottle::flush`]
//! при завершении потока.

use std::time::Duration;

#[derive(Debug)]
pub struct EmitThrottle {
    buffer: String,
    last_emit: Duration,
    min_interval: Duration,
}

impl EmitThrottle {
    /// `now` — показание часов на старте сессии: первый фрагмент выйдет
    /// не раньше, чем через `min_interval` после него.
    pub fn new(min_interval: Duration, now: Duration) -> Self {
        Self {
            buffer: String::new(),
            last_emit: now,
            min_interval,
        }
    }

    /// Добавить текст в ожидающий буфер.
    pub fn push(&mut self, text: &str) {
        self.buffer.push_str(text);
    }

    /// Есть ли неэмиченный текст.
    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Забрать буфер, если интервал выдержан и буфер непуст.
    pub fn poll(&mut self, now: Duration) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        if now.saturating_sub(self.last_emit) < self.min_interval {
            return None;
        }
        self.last_emit = now;
        Some(std::mem::take(&mut self.buffer))
    }

    /// Принудительный финальный сброс (без учёта интервала).
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_poll_respects_min_interval() {
        let mut throttle = EmitThrottle::new(ms(250), ms(0));
        throttle.push("привет");

        assert_eq!(throttle.poll(ms(100)), None);
        assert_eq!(throttle.poll(ms(249)), None);
        assert_eq!(throttle.poll(ms(250)), Some("привет".to_string()));
        assert!(!throttle.has_pending());

        // интервал отсчитывается от последней эмиссии
        throttle.push(", мир");
        assert_eq!(throttle.poll(ms(300)), None);
        assert_eq!(throttle.poll(ms(500)), Some(", мир".to_string()));
    }

    #[test]
    fn test_poll_empty_buffer_never_emits() {
        let mut throttle = EmitThrottle::new(ms(250), ms(0));
        assert_eq!(throttle.poll(ms(10_000)), None);
    }

    #[test]
    fn test_flush_ignores_interval_and_drains() {
        let mut throttle = EmitThrottle::new(ms(250), ms(0));
        throttle.push("хвост");
        assert_eq!(throttle.flush(), Some("хвост".to_string()));
        assert_eq!(throttle.flush(), None);
    }

    #[test]
    fn test_text_is_accumulated_in_order() {
        let mut throttle = EmitThrottle::new(ms(100), ms(0));
        throttle.push("a");
        throttle.push("b");
        throttle.push("c");
        assert_eq!(throttle.poll(ms(100)), Some("abc".to_string()));
    }
}
