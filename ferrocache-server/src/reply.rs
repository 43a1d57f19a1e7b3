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

//! Line-reply rendering shared by every dispatcher (§6): `STORED`, `NOT_STORED`, `DELETED`,
//! `NOT_FOUND`, `VALUE <k> <flags> <bytes>\r\n<data>\r\nEND`, `ERROR`.

use ferrocache_protocol::{ProtocolError, Reply};

pub(crate) fn format_reply(reply: &Reply) -> Vec<u8> {
    match reply {
        Reply::Stored => b"STORED\r\n".to_vec(),
        Reply::NotStored => b"NOT_STORED\r\n".to_vec(),
        Reply::Deleted => b"DELETED\r\n".to_vec(),
        Reply::NotFound => b"NOT_FOUND\r\n".to_vec(),
        Reply::CombinerShutDown => b"SERVER_ERROR combiner shut down\r\n".to_vec(),
        Reply::Values(values) => {
            let mut out = Vec::new();
            for entry in values {
                out.extend_from_slice(b"VALUE ");
                out.extend_from_slice(&entry.key);
                out.extend_from_slice(format!(" {} {}\r\n", entry.flags, entry.value.len()).as_bytes());
                out.extend_from_slice(&entry.value);
                out.extend_from_slice(b"\r\n");
            }
            out.extend_from_slice(b"END\r\n");
            out
        }
    }
}

pub(crate) fn format_error(err: &ProtocolError) -> Vec<u8> {
    format!("ERROR {}\r\n", err).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrocache_protocol::ValueEntry;

    #[test]
    fn values_reply_lists_each_entry_then_end() {
        let reply = Reply::Values(vec![ValueEntry {
            key: b"k".to_vec(),
            flags: 0,
            value: b"v".to_vec(),
        }]);
        assert_eq!(format_reply(&reply), b"VALUE k 0 1\r\nv\r\nEND\r\n".to_vec());
    }

    #[test]
    fn empty_values_reply_is_just_end() {
        let reply = Reply::Values(vec![]);
        assert_eq!(format_reply(&reply), b"END\r\n".to_vec());
    }
}
