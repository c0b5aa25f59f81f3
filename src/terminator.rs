//! Line-termination policy for framing commands and delimiting responses.
//!
//! Instruments disagree on what marks the end of a message: some expect CR,
//! some LF, some CRLF, and a few (notably drain-style serial devices) use no
//! terminator at all. The registry stores the convention per instrument using
//! the shorthand spellings `CR`, `LF`, `CRLF` and `none`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// End-of-message convention for one instrument channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Terminator {
    /// No terminator; a response is whatever one underlying read returns.
    None,
    /// Carriage return (`\r`).
    Cr,
    /// Line feed (`\n`).
    Lf,
    /// Carriage return + line feed (`\r\n`).
    CrLf,
}

impl Terminator {
    /// The terminator byte sequence (empty for `None`).
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Terminator::None => b"",
            Terminator::Cr => b"\r",
            Terminator::Lf => b"\n",
            Terminator::CrLf => b"\r\n",
        }
    }

    /// Append the terminator to an outgoing command.
    pub fn frame(self, command: &str) -> Vec<u8> {
        let mut framed = Vec::with_capacity(command.len() + 2);
        framed.extend_from_slice(command.as_bytes());
        framed.extend_from_slice(self.as_bytes());
        framed
    }

    /// Whether the accumulated response buffer ends with the terminator.
    ///
    /// For `None` this is always true: the session must not attempt
    /// multi-chunk reassembly, one successful read is one response.
    pub fn is_complete(self, buffer: &[u8]) -> bool {
        match self {
            Terminator::None => true,
            _ => buffer.ends_with(self.as_bytes()),
        }
    }

    /// Strip one trailing terminator (and stray `\r`/`\n` the instrument may
    /// have added) from a response buffer.
    pub fn strip(self, buffer: &[u8]) -> &[u8] {
        let without = match self {
            Terminator::None => buffer,
            _ => buffer.strip_suffix(self.as_bytes()).unwrap_or(buffer),
        };
        let mut end = without.len();
        while end > 0 && (without[end - 1] == b'\r' || without[end - 1] == b'\n') {
            end -= 1;
        }
        &without[..end]
    }

    /// Registry spelling of this terminator.
    pub fn label(self) -> &'static str {
        match self {
            Terminator::None => "none",
            Terminator::Cr => "CR",
            Terminator::Lf => "LF",
            Terminator::CrLf => "CRLF",
        }
    }
}

impl FromStr for Terminator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "" | "NONE" => Ok(Terminator::None),
            "CR" => Ok(Terminator::Cr),
            "LF" => Ok(Terminator::Lf),
            "CRLF" => Ok(Terminator::CrLf),
            other => Err(format!(
                "unrecognised terminating_char '{other}' (expected CR, LF, CRLF or none)"
            )),
        }
    }
}

impl TryFrom<String> for Terminator {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Terminator> for String {
    fn from(value: Terminator) -> Self {
        value.label().to_string()
    }
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_then_is_complete_round_trips() {
        for term in [
            Terminator::None,
            Terminator::Cr,
            Terminator::Lf,
            Terminator::CrLf,
        ] {
            let framed = term.frame("*IDN?");
            assert!(term.is_complete(&framed), "{term} framing incomplete");
            assert_eq!(term.strip(&framed), b"*IDN?", "{term} strip mismatch");
        }
    }

    #[test]
    fn lf_frames_with_single_newline() {
        assert_eq!(Terminator::Lf.frame("*IDN?"), b"*IDN?\n");
    }

    #[test]
    fn none_completes_after_any_read() {
        assert!(Terminator::None.is_complete(b""));
        assert!(Terminator::None.is_complete(b"partial data"));
    }

    #[test]
    fn crlf_not_satisfied_by_bare_lf() {
        assert!(!Terminator::CrLf.is_complete(b"response\n"));
        assert!(Terminator::CrLf.is_complete(b"response\r\n"));
    }

    #[test]
    fn strip_removes_stray_line_endings() {
        assert_eq!(Terminator::Lf.strip(b"3.5E-3\r\n"), b"3.5E-3");
        assert_eq!(Terminator::None.strip(b"ok\r"), b"ok");
    }

    #[test]
    fn parses_registry_spellings() {
        assert_eq!("CR".parse::<Terminator>(), Ok(Terminator::Cr));
        assert_eq!("lf".parse::<Terminator>(), Ok(Terminator::Lf));
        assert_eq!("CRLF".parse::<Terminator>(), Ok(Terminator::CrLf));
        assert_eq!("none".parse::<Terminator>(), Ok(Terminator::None));
        assert_eq!("".parse::<Terminator>(), Ok(Terminator::None));
        assert!("EOL".parse::<Terminator>().is_err());
    }
}
