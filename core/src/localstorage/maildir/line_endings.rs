/*
 * line_endings.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Portcullis, an IMAP/POP3 login front-end.
 *
 * Portcullis is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Portcullis is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Portcullis.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Line ending normalisation for saved messages. Bare CRs are left alone.

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    SawCr,
}

/// Streaming converter to CRLF or LF line endings.
pub struct LineEndings {
    crlf: bool,
    state: State,
}

impl LineEndings {
    pub fn new(crlf: bool) -> Self {
        Self {
            crlf,
            state: State::Normal,
        }
    }

    /// Process a chunk; call `out` for each slice to write.
    pub fn process_chunk<F>(&mut self, chunk: &[u8], out: F)
    where
        F: FnMut(&[u8]),
    {
        if self.crlf {
            self.convert_crlf(chunk, out)
        } else {
            self.convert_lf(chunk, out)
        }
    }

    fn convert_crlf<F>(&mut self, chunk: &[u8], mut out: F)
    where
        F: FnMut(&[u8]),
    {
        let mut start = 0;
        for (i, &b) in chunk.iter().enumerate() {
            if b == b'\n' && self.state != State::SawCr {
                if start < i {
                    out(&chunk[start..i]);
                }
                out(b"\r\n");
                start = i + 1;
            }
            self.state = if b == b'\r' { State::SawCr } else { State::Normal };
        }
        if start < chunk.len() {
            out(&chunk[start..]);
        }
    }

    fn convert_lf<F>(&mut self, chunk: &[u8], mut out: F)
    where
        F: FnMut(&[u8]),
    {
        // A CR is held back until we know whether an LF follows it.
        let mut start = 0;
        for (i, &b) in chunk.iter().enumerate() {
            if b == b'\r' {
                if start < i {
                    out(&chunk[start..i]);
                }
                if self.state == State::SawCr {
                    out(b"\r");
                }
                start = i + 1;
                self.state = State::SawCr;
            } else {
                if self.state == State::SawCr && b != b'\n' {
                    out(b"\r");
                }
                self.state = State::Normal;
            }
        }
        if start < chunk.len() {
            out(&chunk[start..]);
        }
    }

    /// Emit anything held back; reset state.
    pub fn finish<F>(&mut self, mut out: F)
    where
        F: FnMut(&[u8]),
    {
        if !self.crlf && self.state == State::SawCr {
            out(b"\r");
        }
        self.state = State::Normal;
    }
}
