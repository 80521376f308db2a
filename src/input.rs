//! Input events (§6).
//!
//! The launcher owns the actual input device (keyboard, remote, whatever);
//! the core only ever sees this closed set of events, polled non-blocking
//! between frames. Everything else the launcher might produce is ignored.

/// One polled input event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    Quit,
    ToggleOverlay,
    SelectCorner(usize),
    NudgeCorner { dx: i8, dy: i8 },
    ResetKeystone,
}

/// A non-blocking source of input events, supplied by the external
/// launcher. `poll` must never block the render loop.
pub trait InputSource: Send {
    /// Return the next pending event, if any. Called once per frame;
    /// implementations that can produce more than one event per frame
    /// should queue internally and return them one at a time.
    fn poll(&mut self) -> Option<InputEvent>;
}

/// An [`InputSource`] that never produces events, for headless operation
/// or tests that don't exercise keystone adjustment.
pub struct NoInput;

impl InputSource for NoInput {
    fn poll(&mut self) -> Option<InputEvent> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_input_never_produces_an_event() {
        let mut source = NoInput;
        assert_eq!(source.poll(), None);
    }

    struct Scripted(std::vec::IntoIter<InputEvent>);

    impl InputSource for Scripted {
        fn poll(&mut self) -> Option<InputEvent> {
            self.0.next()
        }
    }

    #[test]
    fn scripted_source_drains_in_order() {
        let mut source = Scripted(vec![InputEvent::ToggleOverlay, InputEvent::Quit].into_iter());
        assert_eq!(source.poll(), Some(InputEvent::ToggleOverlay));
        assert_eq!(source.poll(), Some(InputEvent::Quit));
        assert_eq!(source.poll(), None);
    }
}
