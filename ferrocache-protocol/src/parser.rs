//  Copyright 2024 ferrocache contributors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! Transport-agnostic parsing of memcached-style text command lines. A dispatcher in
//! `ferrocache-server` owns the socket; it hands this module complete lines and, for storage
//! verbs, the fixed-length payload that follows — mirroring the two-phase read in
//! `ServerImpl::RunConnection` (parse the header line, learn how many more bytes the argument
//! needs, then read exactly that many).

use crate::command::Command;
use crate::error::{ProtocolError, Result};

/// A storage command whose header has been parsed but whose payload has not yet arrived.
/// `payload_len` tells the caller exactly how many bytes to read next (the data block, not
/// counting the trailing `\r\n`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPayload {
    verb: StorageVerb,
    key: Vec<u8>,
    noreply: bool,
    payload_len: usize,
}

impl PendingPayload {
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Combine the previously parsed header with the now-available payload to produce a
    /// complete [`Command`]. `payload` must be exactly [`PendingPayload::payload_len`] bytes
    /// (callers strip the trailing `\r\n` before calling this).
    pub fn finish(self, payload: Vec<u8>) -> Result<Command> {
        if payload.len() != self.payload_len {
            return Err(ProtocolError::ByteCountMismatch {
                declared: self.payload_len,
                received: payload.len(),
            });
        }
        Ok(match self.verb {
            StorageVerb::Set => Command::Set {
                key: self.key,
                value: payload,
                noreply: self.noreply,
            },
            StorageVerb::Add => Command::Add {
                key: self.key,
                value: payload,
                noreply: self.noreply,
            },
            StorageVerb::Replace => Command::Replace {
                key: self.key,
                value: payload,
                noreply: self.noreply,
            },
            StorageVerb::Append => Command::Append {
                key: self.key,
                value: payload,
                noreply: self.noreply,
            },
            StorageVerb::Prepend => Command::Prepend {
                key: self.key,
                value: payload,
                noreply: self.noreply,
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorageVerb {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

/// Result of parsing one command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    /// `get`/`delete` carry no payload; the command is ready immediately.
    Complete(Command),
    /// `set`/`add`/`replace`/`append`/`prepend` need `payload_len()` more bytes before the
    /// command is ready.
    NeedsPayload(PendingPayload),
}

/// Parse one command line (without its trailing `\r\n`). `noreply` is recognized as a trailing
/// token on any command, matching `Command::ExtractArguments`'s `" noreply"` suffix stripping.
pub fn parse_line(line: &str) -> Result<ParsedLine> {
    let mut tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.is_empty() {
        return Err(ProtocolError::MalformedLine(line.to_string()));
    }

    let noreply = tokens.last() == Some(&"noreply");
    if noreply {
        tokens.pop();
    }

    let verb = tokens[0];
    match verb {
        "set" | "add" | "replace" | "append" | "prepend" => {
            parse_storage_line(verb, &tokens[1..], noreply, line)
        }
        "get" => parse_get_line(&tokens[1..], line),
        "delete" => parse_delete_line(&tokens[1..], noreply, line),
        other => Err(ProtocolError::UnknownVerb(other.to_string())),
    }
}

fn parse_storage_line(
    verb: &str,
    args: &[&str],
    noreply: bool,
    line: &str,
) -> Result<ParsedLine> {
    // <key> <flags> <exptime> <bytes>
    let key = args.first().ok_or_else(|| missing(verb, "key"))?;
    let _flags: u32 = args
        .get(1)
        .ok_or_else(|| missing(verb, "flags"))?
        .parse()
        .map_err(|_| ProtocolError::MalformedLine(line.to_string()))?;
    let _exptime: i64 = args
        .get(2)
        .ok_or_else(|| missing(verb, "exptime"))?
        .parse()
        .map_err(|_| ProtocolError::MalformedLine(line.to_string()))?;
    let bytes: usize = args
        .get(3)
        .ok_or_else(|| missing(verb, "bytes"))?
        .parse()
        .map_err(|_| ProtocolError::MalformedLine(line.to_string()))?;

    let storage_verb = match verb {
        "set" => StorageVerb::Set,
        "add" => StorageVerb::Add,
        "replace" => StorageVerb::Replace,
        "append" => StorageVerb::Append,
        "prepend" => StorageVerb::Prepend,
        _ => unreachable!("caller already matched one of the storage verbs"),
    };

    Ok(ParsedLine::NeedsPayload(PendingPayload {
        verb: storage_verb,
        key: key.as_bytes().to_vec(),
        noreply,
        payload_len: bytes,
    }))
}

fn parse_get_line(args: &[&str], line: &str) -> Result<ParsedLine> {
    if args.is_empty() {
        return Err(ProtocolError::MalformedLine(line.to_string()));
    }
    let keys = args.iter().map(|k| k.as_bytes().to_vec()).collect();
    Ok(ParsedLine::Complete(Command::Get { keys }))
}

fn parse_delete_line(args: &[&str], noreply: bool, line: &str) -> Result<ParsedLine> {
    let key = args
        .first()
        .ok_or_else(|| missing("delete", "key"))?
        .as_bytes()
        .to_vec();
    if args.len() > 1 {
        return Err(ProtocolError::MalformedLine(line.to_string()));
    }
    Ok(ParsedLine::Complete(Command::Delete { key, noreply }))
}

fn missing(verb: &'static str, argument: &'static str) -> ProtocolError {
    ProtocolError::MissingArgument { verb, argument }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_set_header_then_finishes_with_payload() {
        let parsed = parse_line("set mykey 0 0 5").unwrap();
        let ParsedLine::NeedsPayload(pending) = parsed else {
            panic!("expected NeedsPayload");
        };
        assert_eq!(pending.payload_len(), 5);
        let cmd = pending.finish(b"hello".to_vec()).unwrap();
        assert_eq!(
            cmd,
            Command::Set {
                key: b"mykey".to_vec(),
                value: b"hello".to_vec(),
                noreply: false,
            }
        );
    }

    #[test]
    fn recognizes_trailing_noreply() {
        let parsed = parse_line("set k 0 0 1 noreply").unwrap();
        let ParsedLine::NeedsPayload(pending) = parsed else {
            panic!("expected NeedsPayload");
        };
        assert!(pending.noreply);
    }

    #[test]
    fn get_accepts_multiple_keys() {
        let parsed = parse_line("get a b c").unwrap();
        assert_eq!(
            parsed,
            ParsedLine::Complete(Command::Get {
                keys: vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()],
            })
        );
    }

    #[test]
    fn delete_with_noreply() {
        let parsed = parse_line("delete k noreply").unwrap();
        assert_eq!(
            parsed,
            ParsedLine::Complete(Command::Delete {
                key: b"k".to_vec(),
                noreply: true,
            })
        );
    }

    #[test]
    fn unknown_verb_is_rejected() {
        assert!(matches!(
            parse_line("frobnicate k"),
            Err(ProtocolError::UnknownVerb(_))
        ));
    }

    #[test]
    fn payload_length_mismatch_is_rejected() {
        let parsed = parse_line("set k 0 0 5").unwrap();
        let ParsedLine::NeedsPayload(pending) = parsed else {
            panic!("expected NeedsPayload");
        };
        assert!(matches!(
            pending.finish(b"abc".to_vec()),
            Err(ProtocolError::ByteCountMismatch { .. })
        ));
    }
}
