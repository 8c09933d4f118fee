//! Reset-button gesture detection.

pub const DEFAULT_DEBOUNCE_MS: u64 = 50;
pub const DEFAULT_HOLD_MS: u64 = 10_000;

/// Fires once when a debounced input has left its idle level for `hold_ms`.
#[derive(Debug, Clone)]
pub struct LongPress {
    idle_level: bool,
    debounce_ms: u64,
    hold_ms: u64,

    raw_level: bool,
    raw_changed_ms: u64,
    stable_level: bool,
    pressed_since_ms: Option<u64>,
    fired: bool,
}

impl LongPress {
    pub fn new(idle_level: bool) -> Self {
        Self::with_timing(idle_level, DEFAULT_DEBOUNCE_MS, DEFAULT_HOLD_MS)
    }

    pub fn with_timing(idle_level: bool, debounce_ms: u64, hold_ms: u64) -> Self {
        Self {
            idle_level,
            debounce_ms,
            hold_ms,
            raw_level: idle_level,
            raw_changed_ms: 0,
            stable_level: idle_level,
            pressed_since_ms: None,
            fired: false,
        }
    }

    pub fn is_pressed(&self) -> bool {
        self.stable_level != self.idle_level
    }

    pub fn update(&mut self, level: bool, now_ms: u64) -> bool {
        if level != self.raw_level {
            self.raw_level = level;
            self.raw_changed_ms = now_ms;
        }

        let settled = now_ms.saturating_sub(self.raw_changed_ms) >= self.debounce_ms;
        if settled && self.raw_level != self.stable_level {
            self.stable_level = self.raw_level;
            if self.is_pressed() {
                self.pressed_since_ms = Some(now_ms);
            } else {
                self.pressed_since_ms = None;
                self.fired = false;
            }
        }

        let Some(since_ms) = self.pressed_since_ms else {
            return false;
        };
        if !self.fired && now_ms.saturating_sub(since_ms) >= self.hold_ms {
            self.fired = true;
            return true;
        }
        false
    }
}
