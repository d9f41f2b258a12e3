//! Byte-at-a-time line assembly for the USB CDC interfaces.

use core::str;

use heapless::Vec;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineError {
    /// The line exceeded the buffer; bytes up to the next terminator were dropped.
    Overflow,
    InvalidUtf8,
}

/// Collects bytes until CR or LF. Backspace and DEL erase the last byte.
pub struct LineBuffer<const N: usize> {
    buffer: Vec<u8, N>,
    overflowed: bool,
    /// The previous call returned a line still borrowed from `buffer`.
    completed: bool,
}

impl<const N: usize> LineBuffer<N> {
    pub const fn new() -> Self {
        Self {
            buffer: Vec::new(),
            overflowed: false,
            completed: false,
        }
    }

    /// Drops any partial line, e.g. when the host disconnects.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.overflowed = false;
        self.completed = false;
    }

    /// Feeds one byte. Returns the finished line when `byte` terminates a
    /// non-empty one.
    pub fn ingest(&mut self, byte: u8) -> Option<Result<&str, LineError>> {
        if self.completed {
            self.buffer.clear();
            self.completed = false;
        }

        match byte {
            b'\r' | b'\n' => {
                if self.overflowed {
                    self.reset();
                    return Some(Err(LineError::Overflow));
                }
                if self.buffer.is_empty() {
                    return None;
                }
                self.completed = true;
                Some(str::from_utf8(&self.buffer).map_err(|_| LineError::InvalidUtf8))
            }
            0x08 | 0x7f => {
                self.buffer.pop();
                None
            }
            value => {
                if !self.overflowed && self.buffer.push(value).is_err() {
                    self.overflowed = true;
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed<const N: usize>(
        buffer: &mut LineBuffer<N>,
        bytes: &[u8],
    ) -> std::vec::Vec<Result<String, LineError>> {
        let mut lines = std::vec::Vec::new();
        for &byte in bytes {
            if let Some(line) = buffer.ingest(byte) {
                lines.push(line.map(str::to_owned));
            }
        }
        lines
    }

    #[test]
    fn lines_end_at_cr_or_lf_and_blank_lines_vanish() {
        let mut buffer: LineBuffer<16> = LineBuffer::new();
        let lines = feed(&mut buffer, b"status\r\n\nstats\n");
        assert_eq!(lines, [Ok("status".to_owned()), Ok("stats".to_owned())]);
    }

    #[test]
    fn backspace_erases() {
        let mut buffer: LineBuffer<16> = LineBuffer::new();
        let lines = feed(&mut buffer, b"helx\x08p\x7f\x7fp\n");
        assert_eq!(lines, [Ok("hep".to_owned())]);
    }

    #[test]
    fn overflow_discards_until_terminator() {
        let mut buffer: LineBuffer<4> = LineBuffer::new();
        let lines = feed(&mut buffer, b"abcdef\nok\n");
        assert_eq!(lines, [Err(LineError::Overflow), Ok("ok".to_owned())]);
    }

    #[test]
    fn invalid_utf8_is_reported() {
        let mut buffer: LineBuffer<4> = LineBuffer::new();
        let lines = feed(&mut buffer, &[0xff, b'\n']);
        assert_eq!(lines, [Err(LineError::InvalidUtf8)]);
    }
}
