/*
 * parser.rs
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

//! Push parser for the worker -> login direction: one handshake, then replies.

use bytes::{Buf, Bytes, BytesMut};

use super::error::WireError;
use super::wire::{Reply, ServerHandshake, MAX_INBUF_SIZE};

/// A complete record read from a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerFrame {
    Handshake(ServerHandshake),
    Reply(Reply, Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    AwaitingHandshake,
    AwaitingReplyHeader,
    AwaitingReplyPayload(Reply),
}

/// Feed bytes via `receive`; complete frames are appended to the output vector.
/// Partial records are left in the buffer.
#[derive(Debug)]
pub struct ReplyParser {
    state: ParseState,
    max_inbuf: usize,
}

impl Default for ReplyParser {
    fn default() -> Self {
        Self::new(MAX_INBUF_SIZE)
    }
}

impl ReplyParser {
    pub fn new(max_inbuf: usize) -> Self {
        Self {
            state: ParseState::AwaitingHandshake,
            max_inbuf,
        }
    }

    pub fn handshake_received(&self) -> bool {
        self.state != ParseState::AwaitingHandshake
    }

    /// Consume as many complete records as possible from buf.
    pub fn receive(
        &mut self,
        buf: &mut BytesMut,
        frames: &mut Vec<WorkerFrame>,
    ) -> Result<(), WireError> {
        loop {
            match self.state {
                ParseState::AwaitingHandshake => {
                    // The worker sends nothing else until we send a request,
                    // so anything beyond the handshake is garbage.
                    if buf.len() > ServerHandshake::SIZE {
                        return Err(WireError::OversizedHandshake {
                            size: buf.len(),
                            expected: ServerHandshake::SIZE,
                        });
                    }
                    if buf.len() < ServerHandshake::SIZE {
                        return Ok(());
                    }
                    let handshake = ServerHandshake::decode(&buf[..])?;
                    if handshake.pid == 0 {
                        return Err(WireError::ZeroPid);
                    }
                    buf.advance(ServerHandshake::SIZE);
                    frames.push(WorkerFrame::Handshake(handshake));
                    self.state = ParseState::AwaitingReplyHeader;
                }
                ParseState::AwaitingReplyHeader => {
                    if buf.len() < Reply::SIZE {
                        return Ok(());
                    }
                    let reply = Reply::decode(&buf[..Reply::SIZE])?;
                    let max = self.max_inbuf.saturating_sub(Reply::SIZE);
                    if reply.data_size as usize > max {
                        return Err(WireError::OversizedReply {
                            size: reply.data_size as usize,
                            max,
                        });
                    }
                    buf.advance(Reply::SIZE);
                    self.state = ParseState::AwaitingReplyPayload(reply);
                }
                ParseState::AwaitingReplyPayload(reply) => {
                    let size = reply.data_size as usize;
                    if buf.len() < size {
                        return Ok(());
                    }
                    let payload = buf.split_to(size).freeze();
                    frames.push(WorkerFrame::Reply(reply, payload));
                    self.state = ParseState::AwaitingReplyHeader;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::mechanism::AuthMech;
    use crate::auth::wire::ReplyResult;

    fn handshake_bytes(pid: u32, mechs: AuthMech) -> BytesMut {
        let mut buf = BytesMut::new();
        ServerHandshake { pid, mechs }.encode(&mut buf);
        buf
    }

    fn reply_bytes(id: u32, result: ReplyResult, data: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        Reply {
            id,
            result,
            data_size: data.len() as u32,
        }
        .encode(&mut buf);
        buf.extend_from_slice(data);
        buf
    }

    #[test]
    fn handshake_waits_for_whole_record() {
        let mut parser = ReplyParser::default();
        let full = handshake_bytes(111, AuthMech::PLAIN);
        let mut buf = BytesMut::from(&full[..5]);
        let mut frames = Vec::new();
        parser.receive(&mut buf, &mut frames).unwrap();
        assert!(frames.is_empty());
        assert!(!parser.handshake_received());

        buf.extend_from_slice(&full[5..]);
        parser.receive(&mut buf, &mut frames).unwrap();
        assert_eq!(
            frames,
            vec![WorkerFrame::Handshake(ServerHandshake {
                pid: 111,
                mechs: AuthMech::PLAIN
            })]
        );
        assert!(buf.is_empty());
        assert!(parser.handshake_received());
    }

    #[test]
    fn oversized_handshake_is_fatal() {
        let mut parser = ReplyParser::default();
        let mut buf = handshake_bytes(111, AuthMech::PLAIN);
        buf.extend_from_slice(&[0]);
        let err = parser.receive(&mut buf, &mut Vec::new()).unwrap_err();
        assert!(matches!(
            err,
            WireError::OversizedHandshake { size: 9, expected: 8 }
        ));
    }

    #[test]
    fn zero_pid_is_fatal() {
        let mut parser = ReplyParser::default();
        let mut buf = handshake_bytes(0, AuthMech::PLAIN);
        let err = parser.receive(&mut buf, &mut Vec::new()).unwrap_err();
        assert!(matches!(err, WireError::ZeroPid));
    }

    #[test]
    fn replies_split_across_reads() {
        let mut parser = ReplyParser::default();
        let mut buf = handshake_bytes(7, AuthMech::PLAIN);
        let mut frames = Vec::new();
        parser.receive(&mut buf, &mut frames).unwrap();
        frames.clear();

        let mut stream = reply_bytes(1, ReplyResult::Continue, b"+");
        stream.extend_from_slice(&reply_bytes(1, ReplyResult::Ok, b""));
        for chunk in stream.chunks(5) {
            buf.extend_from_slice(chunk);
            parser.receive(&mut buf, &mut frames).unwrap();
        }
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            WorkerFrame::Reply(reply, data) => {
                assert_eq!(reply.result, ReplyResult::Continue);
                assert_eq!(&data[..], b"+");
            }
            other => panic!("unexpected frame {:?}", other),
        }
        match &frames[1] {
            WorkerFrame::Reply(reply, data) => {
                assert_eq!(reply.result, ReplyResult::Ok);
                assert!(data.is_empty());
            }
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn reply_larger_than_inbound_buffer_is_fatal() {
        let mut parser = ReplyParser::new(64);
        let mut buf = handshake_bytes(7, AuthMech::PLAIN);
        parser.receive(&mut buf, &mut Vec::new()).unwrap();
        let mut header = BytesMut::new();
        Reply {
            id: 1,
            result: ReplyResult::Ok,
            data_size: 53,
        }
        .encode(&mut header);
        buf.extend_from_slice(&header);
        let err = parser.receive(&mut buf, &mut Vec::new()).unwrap_err();
        assert!(matches!(err, WireError::OversizedReply { size: 53, max: 52 }));
    }
}
