//! Operator console plumbing: the in-band power-off marker detector,
//! the escape-sequence parser and the raw-mode terminal guard.

use std::io::IsTerminal;

use crate::error::Result;

/// Number of consecutive `~` console bytes that signal a graceful
/// firmware power-off.
pub const POWER_OFF_MARKER_LEN: usize = 20;

/// Detects the in-band power-off marker across arbitrary chunking.
#[derive(Debug, Default)]
pub struct PowerOffDetector {
    run: usize,
}

impl PowerOffDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed console bytes; true when a full marker completed inside
    /// this chunk. The run counter resets after a hit, so back-to-back
    /// markers are each detected.
    pub fn feed(&mut self, data: &[u8]) -> bool {
        let mut hit = false;
        for &b in data {
            if b == b'~' {
                self.run += 1;
                if self.run == POWER_OFF_MARKER_LEN {
                    hit = true;
                    self.run = 0;
                }
            } else {
                self.run = 0;
            }
        }
        hit
    }
}

/// Escape prefix byte (Ctrl-A).
pub const ESCAPE_PREFIX: u8 = 0x01;

/// Action selected by the byte following the escape prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeAction {
    Quit,
    PowerOn,
    PowerOff,
    Status,
    VbusOn,
    VbusOff,
    SendBreak,
}

/// What one byte of operator input amounts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorInput {
    /// Forward to the board as console data.
    Console(u8),
    /// Execute an escape action.
    Action(EscapeAction),
}

/// One-shot escape parser over operator keystrokes.
///
/// `0x01` arms the escape; the next byte picks the action. `0x01 a`
/// sends a literal `0x01` as console data; an unrecognized suffix is
/// silently consumed.
#[derive(Debug, Default)]
pub struct EscapeParser {
    armed: bool,
}

impl EscapeParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, byte: u8) -> Option<OperatorInput> {
        if !self.armed {
            if byte == ESCAPE_PREFIX {
                self.armed = true;
                return None;
            }
            return Some(OperatorInput::Console(byte));
        }

        self.armed = false;
        match byte {
            b'q' => Some(OperatorInput::Action(EscapeAction::Quit)),
            b'P' => Some(OperatorInput::Action(EscapeAction::PowerOn)),
            b'p' => Some(OperatorInput::Action(EscapeAction::PowerOff)),
            b's' => Some(OperatorInput::Action(EscapeAction::Status)),
            b'V' => Some(OperatorInput::Action(EscapeAction::VbusOn)),
            b'v' => Some(OperatorInput::Action(EscapeAction::VbusOff)),
            b'B' => Some(OperatorInput::Action(EscapeAction::SendBreak)),
            b'a' => Some(OperatorInput::Console(ESCAPE_PREFIX)),
            _ => None,
        }
    }
}

/// Puts the controlling terminal into raw mode for the session and
/// restores it on drop, which covers every exit path including errors
/// propagating out of the loop.
pub struct RawGuard {
    _private: (),
}

impl RawGuard {
    /// Enable raw mode when stdin is a terminal. `None` means stdin is a
    /// pipe and operator input is not forwarded.
    pub fn enable() -> Result<Option<Self>> {
        if !std::io::stdin().is_terminal() {
            return Ok(None);
        }
        crossterm::terminal::enable_raw_mode().map_err(std::io::Error::from)?;
        Ok(Some(Self { _private: () }))
    }
}

impl Drop for RawGuard {
    fn drop(&mut self) {
        if let Err(err) = crossterm::terminal::disable_raw_mode() {
            tracing::warn!("failed to restore terminal: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_in_one_chunk() {
        let mut det = PowerOffDetector::new();
        let mut data = b"boot log ".to_vec();
        data.extend_from_slice(&[b'~'; 20]);
        data.extend_from_slice(b" tail");
        assert!(det.feed(&data));
    }

    #[test]
    fn test_nineteen_tildes_do_not_trigger() {
        let mut det = PowerOffDetector::new();
        assert!(!det.feed(&[b'~'; 19]));
        // A non-tilde resets; another 19 still must not trigger.
        assert!(!det.feed(b"x"));
        assert!(!det.feed(&[b'~'; 19]));
    }

    #[test]
    fn test_marker_across_chunks() {
        let mut det = PowerOffDetector::new();
        assert!(!det.feed(&[b'~'; 7]));
        assert!(!det.feed(&[b'~'; 7]));
        assert!(det.feed(&[b'~'; 6]));
    }

    #[test]
    fn test_interrupted_run_resets() {
        let mut det = PowerOffDetector::new();
        assert!(!det.feed(&[b'~'; 19]));
        assert!(!det.feed(b"."));
        assert!(!det.feed(&[b'~'; 19]));
        assert!(det.feed(&[b'~'; 1]));
    }

    #[test]
    fn test_twentieth_tilde_completes_and_counter_resets() {
        let mut det = PowerOffDetector::new();
        assert!(det.feed(&[b'~'; 20]));
        // Counter restarted: the next 20 form a fresh marker.
        assert!(det.feed(&[b'~'; 20]));
    }

    #[test]
    fn test_plain_bytes_pass_through() {
        let mut parser = EscapeParser::new();
        assert_eq!(parser.feed(b'x'), Some(OperatorInput::Console(b'x')));
        assert_eq!(parser.feed(b'\n'), Some(OperatorInput::Console(b'\n')));
    }

    #[test]
    fn test_escape_actions() {
        let cases = [
            (b'q', EscapeAction::Quit),
            (b'P', EscapeAction::PowerOn),
            (b'p', EscapeAction::PowerOff),
            (b's', EscapeAction::Status),
            (b'V', EscapeAction::VbusOn),
            (b'v', EscapeAction::VbusOff),
            (b'B', EscapeAction::SendBreak),
        ];
        let mut parser = EscapeParser::new();
        for (byte, action) in cases {
            assert_eq!(parser.feed(ESCAPE_PREFIX), None);
            assert_eq!(parser.feed(byte), Some(OperatorInput::Action(action)));
        }
    }

    #[test]
    fn test_literal_escape_byte() {
        let mut parser = EscapeParser::new();
        assert_eq!(parser.feed(ESCAPE_PREFIX), None);
        assert_eq!(
            parser.feed(b'a'),
            Some(OperatorInput::Console(ESCAPE_PREFIX))
        );
    }

    #[test]
    fn test_unknown_escape_silently_consumed() {
        let mut parser = EscapeParser::new();
        assert_eq!(parser.feed(ESCAPE_PREFIX), None);
        assert_eq!(parser.feed(b'z'), None);
        // Parser is disarmed again; ordinary bytes flow.
        assert_eq!(parser.feed(b'z'), Some(OperatorInput::Console(b'z')));
    }

    #[test]
    fn test_escape_is_one_shot() {
        let mut parser = EscapeParser::new();
        assert_eq!(parser.feed(ESCAPE_PREFIX), None);
        assert_eq!(parser.feed(b'q'), Some(OperatorInput::Action(EscapeAction::Quit)));
        // 'q' without a fresh prefix is plain console data.
        assert_eq!(parser.feed(b'q'), Some(OperatorInput::Console(b'q')));
    }
}
