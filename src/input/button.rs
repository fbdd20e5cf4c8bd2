//! Debounced push-button input
//!
//! Turns electrically noisy press/release edges into clean logical events
//! with two outputs: "pressed" (a short tap) and "held" (activation
//! sustained beyond a threshold). When both callbacks are registered the
//! pressed callback fires on release, so a single press never triggers
//! both.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Minimum spacing between accepted edges
pub const DEBOUNCE_DELAY: Duration = Duration::from_millis(20);
/// Activation length that counts as "held"
pub const HELD_TIME: Duration = Duration::from_secs(2);

/// Raw edge as reported by the line driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEdge {
    Rising,
    Falling,
}

pub type ButtonCallback = Arc<dyn Fn() + Send + Sync>;

/// Debounced digital input line
///
/// Owns its line state exclusively; one instance per physical line. The
/// held timer is realized as a deadline inside the run loop, so it is
/// cancelled the moment a deactivation edge arrives and at most one timer
/// exists per input.
pub struct DebouncedInput {
    debounce_delay: Duration,
    held_time: Duration,
    /// Pull-up wiring: the line rests high and a falling edge activates
    pull_up: bool,
    on_pressed: Option<ButtonCallback>,
    on_held: Option<ButtonCallback>,
}

impl DebouncedInput {
    pub fn new(pull_up: bool) -> Self {
        Self {
            debounce_delay: DEBOUNCE_DELAY,
            held_time: HELD_TIME,
            pull_up,
            on_pressed: None,
            on_held: None,
        }
    }

    pub fn debounce_delay(mut self, delay: Duration) -> Self {
        self.debounce_delay = delay;
        self
    }

    pub fn held_time(mut self, held: Duration) -> Self {
        self.held_time = held;
        self
    }

    /// Callback for a short tap (fires on release when a held callback is
    /// also registered, immediately on activation otherwise)
    pub fn on_pressed(mut self, callback: ButtonCallback) -> Self {
        self.on_pressed = Some(callback);
        self
    }

    /// Callback for a sustained activation, fired exactly once per press
    pub fn on_held(mut self, callback: ButtonCallback) -> Self {
        self.on_held = Some(callback);
        self
    }

    /// Run until the edge channel closes
    pub async fn run(self, mut edges: mpsc::Receiver<RawEdge>) {
        let mut last_raw: Option<RawEdge> = None;
        let mut last_accepted: Option<Instant> = None;
        let mut active = false;
        let mut pressed_consumed = false;
        let mut held_deadline: Option<Instant> = None;

        loop {
            let edge = if let Some(deadline) = held_deadline {
                tokio::select! {
                    edge = edges.recv() => edge,
                    _ = tokio::time::sleep_until(deadline) => {
                        held_deadline = None;
                        if active {
                            debug!("held threshold reached");
                            if let Some(callback) = &self.on_held {
                                callback();
                            }
                            // The release for this press must not also fire
                            // the pressed callback.
                            pressed_consumed = true;
                        }
                        continue;
                    }
                }
            } else {
                edges.recv().await
            };
            let Some(edge) = edge else {
                debug!("edge channel closed - input task ending");
                return;
            };

            // Duplicate-edge anomaly guard: some drivers report the same
            // edge twice in a row.
            if last_raw == Some(edge) {
                debug!("duplicate {:?} edge - ignoring", edge);
                continue;
            }
            last_raw = Some(edge);

            let now = Instant::now();
            if let Some(at) = last_accepted {
                if now.duration_since(at) < self.debounce_delay {
                    debug!("edge within {:?} of the last - ignoring", self.debounce_delay);
                    continue;
                }
            }
            last_accepted = Some(now);

            let activated = (edge == RawEdge::Rising) != self.pull_up;
            if activated {
                if held_deadline.is_some() {
                    debug!("activation while a held timer is pending - bounce");
                    continue;
                }
                active = true;
                pressed_consumed = false;
                if self.on_held.is_some() {
                    held_deadline = Some(now + self.held_time);
                } else if let Some(callback) = &self.on_pressed {
                    debug!("pressed");
                    callback();
                    pressed_consumed = true;
                }
            } else {
                if !active {
                    continue;
                }
                active = false;
                held_deadline = None;
                if !pressed_consumed {
                    if let Some(callback) = &self.on_pressed {
                        debug!("pressed (released before held threshold)");
                        callback();
                    }
                }
                pressed_consumed = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counters {
        pressed: Arc<AtomicUsize>,
        held: Arc<AtomicUsize>,
    }

    /// Spawn an input with both callbacks registered (pull-up wiring, so
    /// falling activates)
    fn spawn_input(with_held: bool) -> (mpsc::Sender<RawEdge>, Counters) {
        let pressed = Arc::new(AtomicUsize::new(0));
        let held = Arc::new(AtomicUsize::new(0));

        let pressed_cb = Arc::clone(&pressed);
        let mut input = DebouncedInput::new(true)
            .on_pressed(Arc::new(move || {
                pressed_cb.fetch_add(1, Ordering::SeqCst);
            }));
        if with_held {
            let held_cb = Arc::clone(&held);
            input = input.on_held(Arc::new(move || {
                held_cb.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(input.run(rx));
        (tx, Counters { pressed, held })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_tap_fires_pressed_not_held() {
        let (tx, counters) = spawn_input(true);

        tx.send(RawEdge::Falling).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(RawEdge::Rising).await.unwrap();
        settle().await;

        assert_eq!(counters.pressed.load(Ordering::SeqCst), 1);
        assert_eq!(counters.held.load(Ordering::SeqCst), 0);

        // The cancelled held timer must never fire late.
        tokio::time::sleep(HELD_TIME * 2).await;
        assert_eq!(counters.held.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_press_fires_held_not_pressed() {
        let (tx, counters) = spawn_input(true);

        tx.send(RawEdge::Falling).await.unwrap();
        tokio::time::sleep(HELD_TIME + Duration::from_millis(100)).await;
        tx.send(RawEdge::Rising).await.unwrap();
        settle().await;

        assert_eq!(counters.pressed.load(Ordering::SeqCst), 0);
        assert_eq!(counters.held.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_edges_never_fire_twice() {
        let (tx, counters) = spawn_input(false);

        // Driver hiccup: the same falling edge reported twice.
        tx.send(RawEdge::Falling).await.unwrap();
        tx.send(RawEdge::Falling).await.unwrap();
        settle().await;

        assert_eq!(counters.pressed.load(Ordering::SeqCst), 1);

        // A clean release and press later works normally.
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(RawEdge::Rising).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(RawEdge::Falling).await.unwrap();
        settle().await;

        assert_eq!(counters.pressed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_edges_within_debounce_window_are_ignored() {
        let (tx, counters) = spawn_input(false);

        tx.send(RawEdge::Falling).await.unwrap();
        settle().await;
        // Bounce: opposite edges chattering inside the debounce window.
        tx.send(RawEdge::Rising).await.unwrap();
        tx.send(RawEdge::Falling).await.unwrap();
        settle().await;

        assert_eq!(counters.pressed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reactivation_during_pending_held_timer_is_a_bounce() {
        let (tx, counters) = spawn_input(true);

        tx.send(RawEdge::Falling).await.unwrap();
        // Chatter after the debounce window: a rising edge inside the
        // debounce window is dropped, the following falling edge lands
        // while the held timer is still pending and must not re-arm it.
        tokio::time::sleep(Duration::from_millis(5)).await;
        tx.send(RawEdge::Rising).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(RawEdge::Falling).await.unwrap();

        tokio::time::sleep(HELD_TIME).await;
        settle().await;

        assert_eq!(counters.held.load(Ordering::SeqCst), 1);
        assert_eq!(counters.pressed.load(Ordering::SeqCst), 0);
    }
}
