//! Button gesture classification at interrupt level.
//!
//! `ButtonClassifier::service` is called from the edge interrupt of the
//! monitored line. It never allocates or blocks; its only outputs are the two
//! `ButtonFlags`, which the orchestrator reads and clears from task context.

use core::sync::atomic::{AtomicBool, Ordering};

pub const LONG_PRESS_MS: u64 = 5_000;
pub const CLICK_WINDOW_US: u64 = 3_000_000;
pub const TRIPLE_CLICK_COUNT: u8 = 3;

/// The monitored input line as seen from the interrupt handler.
pub trait ButtonLine {
    /// Returns whether an interrupt is pending for this line and acknowledges it.
    fn take_pending(&mut self) -> bool;
    /// Current logic level, `true` for high (released on an active-low button).
    fn is_high(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonGesture {
    LongPress,
    TripleClick,
}

/// Single-writer / single-reader semantic flags.
#[derive(Debug, Default)]
pub struct ButtonFlags {
    long_press: AtomicBool,
    triple_click: AtomicBool,
}

impl ButtonFlags {
    pub const fn new() -> Self {
        Self {
            long_press: AtomicBool::new(false),
            triple_click: AtomicBool::new(false),
        }
    }

    pub fn raise(&self, gesture: ButtonGesture) {
        match gesture {
            ButtonGesture::LongPress => self.long_press.store(true, Ordering::Release),
            ButtonGesture::TripleClick => self.triple_click.store(true, Ordering::Release),
        }
    }

    pub fn take_long_press(&self) -> bool {
        self.long_press.swap(false, Ordering::AcqRel)
    }

    pub fn take_triple_click(&self) -> bool {
        self.triple_click.swap(false, Ordering::AcqRel)
    }
}

#[derive(Debug, Clone)]
pub struct ButtonClassifier {
    last_high: bool,
    press_start_us: u64,
    last_release_us: u64,
    click_count: u8,
}

impl Default for ButtonClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ButtonClassifier {
    pub const fn new() -> Self {
        Self {
            last_high: true,
            press_start_us: 0,
            last_release_us: 0,
            click_count: 0,
        }
    }

    /// Interrupt entry point. `now_us` is the monotonic timer in microseconds.
    pub fn service(&mut self, line: &mut impl ButtonLine, now_us: u64, flags: &ButtonFlags) {
        if !line.take_pending() {
            return;
        }

        if let Some(gesture) = self.on_level(line.is_high(), now_us) {
            flags.raise(gesture);
        }
    }

    pub fn on_level(&mut self, high: bool, now_us: u64) -> Option<ButtonGesture> {
        let mut gesture = None;

        if !high && self.last_high {
            self.press_start_us = now_us;
        } else if high && !self.last_high {
            let press_ms = now_us.saturating_sub(self.press_start_us) / 1_000;

            if press_ms >= LONG_PRESS_MS {
                self.click_count = 0;
                gesture = Some(ButtonGesture::LongPress);
            } else {
                if now_us.saturating_sub(self.last_release_us) <= CLICK_WINDOW_US {
                    self.click_count = self.click_count.saturating_add(1);
                } else {
                    self.click_count = 1;
                }
                self.last_release_us = now_us;

                if self.click_count >= TRIPLE_CLICK_COUNT {
                    self.click_count = 0;
                    gesture = Some(ButtonGesture::TripleClick);
                }
            }
        }

        self.last_high = high;
        gesture
    }

    pub fn click_count(&self) -> u8 {
        self.click_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: u64 = 1_000_000;

    struct FakeLine {
        pending: bool,
        high: bool,
    }

    impl ButtonLine for FakeLine {
        fn take_pending(&mut self) -> bool {
            core::mem::replace(&mut self.pending, false)
        }

        fn is_high(&self) -> bool {
            self.high
        }
    }

    fn click(classifier: &mut ButtonClassifier, release_us: u64) -> Option<ButtonGesture> {
        assert_eq!(classifier.on_level(false, release_us.saturating_sub(100_000)), None);
        classifier.on_level(true, release_us)
    }

    #[test]
    fn press_of_exactly_five_seconds_is_long_press() {
        let mut classifier = ButtonClassifier::new();
        classifier.on_level(false, 10 * SECOND);

        let gesture = classifier.on_level(true, 15 * SECOND);

        assert_eq!(gesture, Some(ButtonGesture::LongPress));
        assert_eq!(classifier.click_count(), 0);
    }

    #[test]
    fn press_just_under_five_seconds_counts_as_click() {
        let mut classifier = ButtonClassifier::new();
        classifier.on_level(false, 10 * SECOND);

        let gesture = classifier.on_level(true, 15 * SECOND - 1_000);

        assert_eq!(gesture, None);
        assert_eq!(classifier.click_count(), 1);
    }

    #[test]
    fn three_releases_within_window_raise_triple_click() {
        let mut classifier = ButtonClassifier::new();
        let base = 20 * SECOND;

        assert_eq!(click(&mut classifier, base), None);
        assert_eq!(click(&mut classifier, base + SECOND), None);
        assert_eq!(
            click(&mut classifier, base + 2 * SECOND + SECOND / 2),
            Some(ButtonGesture::TripleClick)
        );
        assert_eq!(classifier.click_count(), 0);

        assert_eq!(click(&mut classifier, base + 10 * SECOND), None);
        assert_eq!(classifier.click_count(), 1);
    }

    #[test]
    fn slow_clicks_restart_the_count() {
        let mut classifier = ButtonClassifier::new();
        let base = 20 * SECOND;

        click(&mut classifier, base);
        click(&mut classifier, base + 2 * SECOND);
        click(&mut classifier, base + 6 * SECOND);

        assert_eq!(classifier.click_count(), 1);
    }

    #[test]
    fn long_press_resets_pending_clicks() {
        let mut classifier = ButtonClassifier::new();
        let base = 20 * SECOND;

        click(&mut classifier, base);
        click(&mut classifier, base + SECOND);
        classifier.on_level(false, base + SECOND + 1);
        assert_eq!(
            classifier.on_level(true, base + 7 * SECOND),
            Some(ButtonGesture::LongPress)
        );
        assert_eq!(click(&mut classifier, base + 8 * SECOND), None);
        assert_eq!(classifier.click_count(), 1);
    }

    #[test]
    fn repeated_levels_only_track_last_level() {
        let mut classifier = ButtonClassifier::new();

        assert_eq!(classifier.on_level(true, SECOND), None);
        classifier.on_level(false, 2 * SECOND);
        assert_eq!(classifier.on_level(false, 9 * SECOND), None);
        assert_eq!(
            classifier.on_level(true, 9 * SECOND),
            Some(ButtonGesture::LongPress)
        );
    }

    #[test]
    fn service_ignores_interrupts_for_other_lines() {
        let flags = ButtonFlags::new();
        let mut classifier = ButtonClassifier::new();
        let mut line = FakeLine {
            pending: false,
            high: false,
        };

        classifier.service(&mut line, SECOND, &flags);
        line.high = true;
        line.pending = true;
        classifier.service(&mut line, 7 * SECOND, &flags);

        assert!(!flags.take_long_press());
        assert_eq!(classifier.click_count(), 0);
    }

    #[test]
    fn service_raises_flags_consumed_once() {
        let flags = ButtonFlags::new();
        let mut classifier = ButtonClassifier::new();
        let mut line = FakeLine {
            pending: true,
            high: false,
        };

        classifier.service(&mut line, SECOND, &flags);
        line.pending = true;
        line.high = true;
        classifier.service(&mut line, 7 * SECOND, &flags);

        assert!(!line.pending);
        assert!(flags.take_long_press());
        assert!(!flags.take_long_press());
        assert!(!flags.take_triple_click());
    }
}
