//! Инжектируемый источник времени.
//!
//! Троттлинг эмиссии (`EmitThrottle`) зависит от часов, поэтому часы —
//! явная зависимость: в продакшене монотонный `SystemClock`, в тестах
//! управляемый `ManualClock` без реального ожидания.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Монотонные часы: текущее показание от произвольной опорной точки.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// Системные монотонные часы (`Instant`), якорь — момент создания.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Ручные часы для тестов: время двигается только явным `advance`.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Продвинуть время вперёд.
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().expect("clock mutex poisoned");
        *now += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock().expect("clock mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), Duration::ZERO);
        clock.advance(Duration::from_millis(300));
        assert_eq!(clock.now(), Duration::from_millis(300));

        // клоны делят одно и то же время
        let clone = clock.clone();
        clone.advance(Duration::from_millis(200));
        assert_eq!(clock.now(), Duration::from_millis(500));
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
