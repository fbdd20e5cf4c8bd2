//! Event coalescing - burst rate limiting with net-delta preservation
//!
//! Shields a downstream receiver (the DSP engine, the display) from a burst
//! of rapid-fire raw events (encoder spins, mixer drags) while never losing
//! net displacement. Events may be discarded, but the callback receives the
//! *relative* delta since the previous emission, so callers using the delta
//! see the full displacement of a burst in a single invocation.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Default wait before an event in a burst is allowed to emit
pub const DISCARD_WINDOW: Duration = Duration::from_millis(100);
/// Bursts are only recognized within this window; older traffic emits
/// immediately
pub const MAX_AGE: Duration = Duration::from_millis(150);

/// Callback invoked once per surviving generation with
/// `(value, direction, delta)`; `delta` is relative to the previous
/// emission, or one signed unit for the very first one
pub type CoalescedCallback = Arc<dyn Fn(f64, i8, f64) + Send + Sync>;

struct CoalescerState {
    /// Monotonically increasing id; the generation that still owns it after
    /// the discard window is the one that emits
    generation: u64,
    last_emitted_value: Option<f64>,
    last_emitted_at: Option<Instant>,
}

/// Generic rate limiter merging bursts of same-kind events into a single
/// delayed callback carrying the net delta
///
/// `event()` is safe to call concurrently from multiple raw-event producers;
/// one short-lived task is spawned per delayed emission. The coalescer has
/// no terminal state and runs for the process lifetime.
pub struct EventCoalescer {
    state: Arc<Mutex<CoalescerState>>,
    callback: CoalescedCallback,
    discard_window: Duration,
    max_age: Duration,
}

impl EventCoalescer {
    pub fn new(callback: CoalescedCallback) -> Self {
        Self::with_timing(callback, DISCARD_WINDOW, MAX_AGE)
    }

    pub fn with_timing(
        callback: CoalescedCallback,
        discard_window: Duration,
        max_age: Duration,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(CoalescerState {
                generation: 0,
                last_emitted_value: None,
                last_emitted_at: None,
            })),
            callback,
            discard_window,
            max_age,
        }
    }

    /// Process one raw event
    ///
    /// Emits immediately when the previous emission is older than `max_age`;
    /// otherwise waits out the discard window and emits only if no newer
    /// event took over meanwhile.
    pub fn event(&self, value: f64, direction: i8) {
        let (my_id, immediate) = {
            let mut state = self.state.lock();
            state.generation += 1;
            let immediate = state
                .last_emitted_at
                .map_or(true, |at| at.elapsed() > self.max_age);
            (state.generation, immediate)
        };

        if immediate {
            debug!("event #{}: no recent emission - emitting now", my_id);
            Self::emit(&self.state, &self.callback, value, direction);
            return;
        }

        let state = Arc::clone(&self.state);
        let callback = Arc::clone(&self.callback);
        let discard_window = self.discard_window;
        tokio::spawn(async move {
            tokio::time::sleep(discard_window).await;
            let superseded = state.lock().generation != my_id;
            if superseded {
                debug!("event #{}: a newer event took over - discarding", my_id);
            } else {
                debug!("event #{}: survived the discard window - emitting", my_id);
                Self::emit(&state, &callback, value, direction);
            }
        });
    }

    fn emit(
        state: &Mutex<CoalescerState>,
        callback: &CoalescedCallback,
        value: f64,
        direction: i8,
    ) {
        let delta = {
            let mut state = state.lock();
            let delta = match state.last_emitted_value {
                Some(previous) => value - previous,
                None => f64::from(direction),
            };
            state.last_emitted_value = Some(value);
            state.last_emitted_at = Some(Instant::now());
            delta
        };
        callback(value, direction, delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_coalescer() -> (EventCoalescer, Arc<Mutex<Vec<(f64, i8, f64)>>>) {
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&emitted);
        let coalescer = EventCoalescer::new(Arc::new(move |value, direction, delta| {
            sink.lock().push((value, direction, delta));
        }));
        (coalescer, emitted)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_event_emits_immediately_with_unit_delta() {
        let (coalescer, emitted) = recording_coalescer();

        coalescer.event(10.0, 1);

        assert_eq!(emitted.lock().as_slice(), &[(10.0, 1, 1.0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_single_emission_with_net_delta() {
        let (coalescer, emitted) = recording_coalescer();

        // Encoder spun 5 clicks; the first opens the stream, the rest land
        // inside the burst window.
        coalescer.event(1.0, 1);
        for value in 2..=5 {
            coalescer.event(f64::from(value), 1);
        }
        tokio::time::sleep(DISCARD_WINDOW * 2).await;

        let emitted = emitted.lock();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0], (1.0, 1, 1.0));
        // Net displacement across the burst, not a unit increment.
        assert_eq!(emitted[1], (5.0, 1, 4.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_last_generation_of_a_burst_survives() {
        let (coalescer, emitted) = recording_coalescer();

        coalescer.event(1.0, 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        coalescer.event(2.0, 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        coalescer.event(3.0, 1);
        tokio::time::sleep(DISCARD_WINDOW * 2).await;

        // First emits immediately; generations 2 and 3 race the window and
        // only the last one fires.
        assert_eq!(emitted.lock().len(), 2);
        assert_eq!(emitted.lock()[1], (3.0, 1, 2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaced_events_all_emit() {
        let (coalescer, emitted) = recording_coalescer();

        coalescer.event(1.0, 1);
        tokio::time::sleep(MAX_AGE * 2).await;
        coalescer.event(5.0, 1);
        tokio::time::sleep(MAX_AGE * 2).await;
        coalescer.event(3.0, -1);

        let emitted = emitted.lock();
        assert_eq!(emitted.len(), 3);
        assert_eq!(emitted[1], (5.0, 1, 4.0));
        assert_eq!(emitted[2], (3.0, -1, -2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_direction_first_event() {
        let (coalescer, emitted) = recording_coalescer();

        coalescer.event(-1.0, -1);

        assert_eq!(emitted.lock().as_slice(), &[(-1.0, -1, -1.0)]);
    }
}
