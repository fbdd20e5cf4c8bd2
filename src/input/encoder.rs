//! Rotary encoder quadrature decoding
//!
//! State-table decoder after Buxton's classic debouncing scheme: the two
//! encoder lines form a 2-bit symbol that advances a 7-state transition
//! table, and only a complete quadrature cycle through the right
//! predecessors emits a step. Partial or bouncing transitions are absorbed
//! by construction, so no time-based debouncing is needed.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

const R_START: u8 = 0x0;
const R_CW_FINAL: u8 = 0x1;
const R_CW_BEGIN: u8 = 0x2;
const R_CW_NEXT: u8 = 0x3;
const R_CCW_BEGIN: u8 = 0x4;
const R_CCW_FINAL: u8 = 0x5;
const R_CCW_NEXT: u8 = 0x6;

/// Clockwise step flag
const DIR_CW: u8 = 0x10;
/// Counter-clockwise step flag
const DIR_CCW: u8 = 0x20;

/// Transition table, indexed by `[state][symbol]`; the low nibble of an
/// entry is the next state, the high nibble carries a step flag
const TTABLE: [[u8; 4]; 7] = [
    // R_START
    [R_START, R_CW_BEGIN, R_CCW_BEGIN, R_START],
    // R_CW_FINAL
    [R_CW_NEXT, R_START, R_CW_FINAL, R_START | DIR_CW],
    // R_CW_BEGIN
    [R_CW_NEXT, R_CW_BEGIN, R_START, R_START],
    // R_CW_NEXT
    [R_CW_NEXT, R_CW_BEGIN, R_CW_FINAL, R_START],
    // R_CCW_BEGIN
    [R_CCW_NEXT, R_START, R_CCW_BEGIN, R_START],
    // R_CCW_FINAL
    [R_CCW_NEXT, R_CCW_FINAL, R_START, R_START | DIR_CCW],
    // R_CCW_NEXT
    [R_CCW_NEXT, R_CCW_FINAL, R_CCW_BEGIN, R_START],
];

/// Rotation direction of an emitted step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Clockwise,
    CounterClockwise,
}

impl Direction {
    /// Signed unit step
    pub fn unit(self) -> i8 {
        match self {
            Direction::Clockwise => 1,
            Direction::CounterClockwise => -1,
        }
    }
}

/// One full detent worth of rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// Cumulative signed value after this step
    pub value: i64,
    pub direction: Direction,
}

/// Quadrature state machine
///
/// Pure and allocation-free; feed it line levels, get detent steps back.
pub struct QuadratureDecoder {
    state: u8,
    value: i64,
    last_direction: Option<Direction>,
    invert: bool,
}

impl QuadratureDecoder {
    /// `invert` flips the symbol for encoders wired the other way around
    /// (rest state low instead of high)
    pub fn new(invert: bool) -> Self {
        Self {
            state: R_START,
            value: 0,
            last_direction: None,
            invert,
        }
    }

    /// Cumulative signed value (detents since process start)
    pub fn value(&self) -> i64 {
        self.value
    }

    pub fn last_direction(&self) -> Option<Direction> {
        self.last_direction
    }

    /// Advance the state machine with the current line levels
    ///
    /// Returns a step only when a full detent cycle completes.
    pub fn process(&mut self, pin_a: bool, pin_b: bool) -> Option<Step> {
        let mut symbol = (u8::from(pin_a) << 1) | u8::from(pin_b);
        if self.invert {
            symbol = !symbol & 0x03;
        }

        self.state = TTABLE[(self.state & 0x0F) as usize][symbol as usize];

        let direction = match self.state & (DIR_CW | DIR_CCW) {
            DIR_CW => Direction::Clockwise,
            DIR_CCW => Direction::CounterClockwise,
            _ => return None,
        };

        self.value += i64::from(direction.unit());
        self.last_direction = Some(direction);
        Some(Step {
            value: self.value,
            direction,
        })
    }
}

/// Step callback, invoked with the cumulative value and the signed unit
/// direction of the detent that completed
pub type StepCallback = Arc<dyn Fn(i64, i8) + Send + Sync>;

/// Async pump: drains a line-level snapshot channel through the decoder and
/// invokes the callback once per detent
///
/// The callback must be cheap; slow consumers coalesce on their own side.
pub struct Encoder {
    decoder: QuadratureDecoder,
    callback: StepCallback,
}

impl Encoder {
    pub fn new(invert: bool, callback: StepCallback) -> Self {
        Self {
            decoder: QuadratureDecoder::new(invert),
            callback,
        }
    }

    /// Run until the level channel closes
    pub async fn run(mut self, mut levels: mpsc::Receiver<(bool, bool)>) {
        while let Some((pin_a, pin_b)) = levels.recv().await {
            if let Some(step) = self.decoder.process(pin_a, pin_b) {
                debug!(
                    "detent: value={} direction={:?}",
                    step.value, step.direction
                );
                (self.callback)(step.value, step.direction.unit());
            }
        }
        debug!("level channel closed - encoder task ending");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use proptest::prelude::*;

    /// Symbol sequence of one clockwise detent, starting from rest (both
    /// lines high)
    const CW_CYCLE: [(bool, bool); 4] = [(false, true), (false, false), (true, false), (true, true)];
    /// Symbol sequence of one counter-clockwise detent
    const CCW_CYCLE: [(bool, bool); 4] =
        [(true, false), (false, false), (false, true), (true, true)];

    fn feed(decoder: &mut QuadratureDecoder, cycle: &[(bool, bool)]) -> Vec<Step> {
        cycle
            .iter()
            .filter_map(|&(a, b)| decoder.process(a, b))
            .collect()
    }

    #[test]
    fn test_cw_cycle_emits_one_positive_step() {
        let mut decoder = QuadratureDecoder::new(false);
        let steps = feed(&mut decoder, &CW_CYCLE);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].value, 1);
        assert_eq!(steps[0].direction, Direction::Clockwise);
        assert_eq!(decoder.value(), 1);
    }

    #[test]
    fn test_ccw_cycle_emits_one_negative_step() {
        let mut decoder = QuadratureDecoder::new(false);
        let steps = feed(&mut decoder, &CCW_CYCLE);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].value, -1);
        assert_eq!(steps[0].direction, Direction::CounterClockwise);
    }

    #[test]
    fn test_partial_rotation_emits_nothing() {
        let mut decoder = QuadratureDecoder::new(false);
        // Begin a clockwise cycle, then fall back to rest.
        assert!(decoder.process(false, true).is_none());
        assert!(decoder.process(true, true).is_none());
        assert_eq!(decoder.value(), 0);
        // A later full cycle still decodes cleanly.
        assert_eq!(feed(&mut decoder, &CW_CYCLE).len(), 1);
    }

    #[test]
    fn test_net_sum_matches_detents() {
        let mut decoder = QuadratureDecoder::new(false);
        for _ in 0..3 {
            feed(&mut decoder, &CW_CYCLE);
        }
        for _ in 0..5 {
            feed(&mut decoder, &CCW_CYCLE);
        }
        assert_eq!(decoder.value(), -2);
    }

    #[test]
    fn test_inverted_wiring() {
        // Same rotation on an encoder resting low: every symbol is the
        // complement of the pull-up one.
        let mut decoder = QuadratureDecoder::new(true);
        let inverted: Vec<(bool, bool)> = CW_CYCLE.iter().map(|&(a, b)| (!a, !b)).collect();
        let steps = feed(&mut decoder, &inverted);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].direction, Direction::Clockwise);
    }

    proptest! {
        /// Contact bounce repeats a symbol while the contacts settle; the
        /// table absorbs repeats, so the step count only depends on the
        /// detents traversed.
        #[test]
        fn prop_bounce_repeats_never_change_step_count(
            detents in prop::collection::vec(any::<bool>(), 1..12),
            repeats in prop::collection::vec(1usize..4, 4),
        ) {
            let mut clean = QuadratureDecoder::new(false);
            let mut bouncy = QuadratureDecoder::new(false);

            for &cw in &detents {
                let cycle = if cw { CW_CYCLE } else { CCW_CYCLE };
                for (i, &(a, b)) in cycle.iter().enumerate() {
                    clean.process(a, b);
                    for _ in 0..repeats[i] {
                        bouncy.process(a, b);
                    }
                }
            }

            prop_assert_eq!(clean.value(), bouncy.value());
        }
    }

    #[tokio::test]
    async fn test_encoder_pump_invokes_callback_per_detent() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let encoder = Encoder::new(
            false,
            Arc::new(move |value, direction| sink.lock().push((value, direction))),
        );

        let (tx, rx) = mpsc::channel(32);
        let pump = tokio::spawn(encoder.run(rx));
        for _ in 0..3 {
            for &(a, b) in &CW_CYCLE {
                tx.send((a, b)).await.unwrap();
            }
        }
        drop(tx);
        pump.await.unwrap();

        assert_eq!(seen.lock().as_slice(), &[(1, 1), (2, 1), (3, 1)]);
    }
}
