//! Decoder state machine (§4.4).
//!
//! `PLAYING` is the steady state; transitions back to `DRAINING` happen
//! transparently on every `retry` outcome and are not observed outside
//! this module.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Opening,
    Draining,
    Playing,
    Ended,
    Broken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    OpenOk,
    OpenFail,
    NextOk,
    Retry,
    Eof,
    Fatal,
}

impl StreamState {
    /// Apply a transition, returning the new state. Invalid transitions
    /// (e.g. `OpenOk` from `Playing`) are a caller bug and panic rather
    /// than silently producing a nonsense state.
    pub fn apply(self, transition: Transition) -> StreamState {
        use StreamState::*;
        use Transition::*;
        match (self, transition) {
            (Opening, OpenOk) => Draining,
            (Opening, OpenFail) => Broken,
            (Draining, NextOk) => Playing,
            (Draining, Retry) => Playing,
            (Draining, Eof) => Ended,
            (Draining, Fatal) => Broken,
            (Playing, NextOk) => Playing,
            (Playing, Retry) => Draining,
            (Playing, Eof) => Ended,
            (Playing, Fatal) => Broken,
            (state, transition) => panic!(
                "invalid decoder state transition: {:?} on {:?}",
                transition, state
            ),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Ended | StreamState::Broken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use StreamState::*;
    use Transition::*;

    #[test]
    fn open_ok_then_first_frame_reaches_playing() {
        let state = Opening.apply(OpenOk).apply(NextOk);
        assert_eq!(state, Playing);
    }

    #[test]
    fn open_fail_is_immediately_broken() {
        assert_eq!(Opening.apply(OpenFail), Broken);
    }

    #[test]
    fn retry_bounces_through_draining_transparently() {
        let mut state = Opening.apply(OpenOk).apply(NextOk);
        for _ in 0..5 {
            state = state.apply(Retry).apply(NextOk);
            assert_eq!(state, Playing);
        }
    }

    #[test]
    fn eof_and_fatal_are_terminal() {
        let ended = Opening.apply(OpenOk).apply(Eof);
        let broken = Opening.apply(OpenOk).apply(Fatal);
        assert!(ended.is_terminal());
        assert!(broken.is_terminal());
    }

    #[test]
    #[should_panic(expected = "invalid decoder state transition")]
    fn next_ok_from_opening_is_invalid() {
        Opening.apply(NextOk);
    }
}
