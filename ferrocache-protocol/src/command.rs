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

//! Command descriptors and their dispatch against the five-operation storage contract (§4.1,
//! §6). Grounded on `examples/original_source/src/execute/Command.cpp` and
//! `include/afina/execute/Add.h` for the per-verb execute/reply shape (`STORED`/`NOT_STORED`
//! depending on whether the precondition for the verb held).
//!
//! `replace`, `append`, and `prepend` have no direct counterpart among `put`/`put_if_absent`/
//! `set`/`delete`/`get`: each is expressed here as a `get` followed by a conditional `set`. That
//! composition is not atomic under the flat combiner (another submitter's operation can land
//! between the two calls), which the text protocol never guarantees either way; bit-exact
//! protocol framing is explicitly out of scope (§1), so this dispatcher accepts the same race the
//! original single-`Storage`-call commands never had to contend with.

use ferrocache_common::error::CombineError;

/// The five-operation storage contract every dispatcher programs against (§6).
pub trait Storage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<bool, CombineError>;
    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<bool, CombineError>;
    fn set(&self, key: &[u8], value: &[u8]) -> Result<bool, CombineError>;
    fn delete(&self, key: &[u8]) -> Result<bool, CombineError>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CombineError>;
}

impl Storage for ferrocache_memory::FlatCombinedStore {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<bool, CombineError> {
        ferrocache_memory::FlatCombinedStore::put(self, key, value)
    }

    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<bool, CombineError> {
        ferrocache_memory::FlatCombinedStore::put_if_absent(self, key, value)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<bool, CombineError> {
        ferrocache_memory::FlatCombinedStore::set(self, key, value)
    }

    fn delete(&self, key: &[u8]) -> Result<bool, CombineError> {
        ferrocache_memory::FlatCombinedStore::delete(self, key)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CombineError> {
        ferrocache_memory::FlatCombinedStore::get(self, key)
    }
}

/// A fully parsed command, ready to dispatch against a [`Storage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set { key: Vec<u8>, value: Vec<u8>, noreply: bool },
    Add { key: Vec<u8>, value: Vec<u8>, noreply: bool },
    Replace { key: Vec<u8>, value: Vec<u8>, noreply: bool },
    Append { key: Vec<u8>, value: Vec<u8>, noreply: bool },
    Prepend { key: Vec<u8>, value: Vec<u8>, noreply: bool },
    Get { keys: Vec<Vec<u8>> },
    Delete { key: Vec<u8>, noreply: bool },
}

impl Command {
    /// Whether the caller asked to suppress the reply line (`noreply`). `get` never suppresses
    /// its reply since the response *is* the point of the command.
    pub fn noreply(&self) -> bool {
        match self {
            Command::Set { noreply, .. }
            | Command::Add { noreply, .. }
            | Command::Replace { noreply, .. }
            | Command::Append { noreply, .. }
            | Command::Prepend { noreply, .. }
            | Command::Delete { noreply, .. } => *noreply,
            Command::Get { .. } => false,
        }
    }
}

/// One entry of a `get` reply: `VALUE <key> <flags> <bytes>\r\n<data>\r\n`. `flags` is always 0
/// here — the storage contract has no concept of a client-supplied flags word (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueEntry {
    pub key: Vec<u8>,
    pub flags: u32,
    pub value: Vec<u8>,
}

/// Outcome of executing a [`Command`], ready for a dispatcher to render as `STORED`,
/// `NOT_STORED`, `DELETED`, `NOT_FOUND`, `VALUE ... END`, or `ERROR` (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Stored,
    NotStored,
    Deleted,
    NotFound,
    Values(Vec<ValueEntry>),
    CombinerShutDown,
}

/// Execute `command` against `storage`, producing the reply the command's verb defines.
pub fn execute(command: &Command, storage: &dyn Storage) -> Reply {
    let outcome = match command {
        Command::Set { key, value, .. } => storage.set(key, value).map(stored_reply),
        Command::Add { key, value, .. } => storage.put_if_absent(key, value).map(stored_reply),
        Command::Replace { key, value, .. } => execute_replace(storage, key, value),
        Command::Append { key, value, .. } => execute_concat(storage, key, value, Concat::Append),
        Command::Prepend { key, value, .. } => {
            execute_concat(storage, key, value, Concat::Prepend)
        }
        Command::Delete { key, .. } => storage.delete(key).map(deleted_reply),
        Command::Get { keys } => return execute_get(storage, keys),
    };

    match outcome {
        Ok(reply) => reply,
        Err(CombineError::ShutDown) => {
            tracing::warn!("command dropped: combiner has shut down");
            Reply::CombinerShutDown
        }
    }
}

fn stored_reply(stored: bool) -> Reply {
    if stored {
        Reply::Stored
    } else {
        Reply::NotStored
    }
}

fn deleted_reply(deleted: bool) -> Reply {
    if deleted {
        Reply::Deleted
    } else {
        Reply::NotFound
    }
}

fn execute_replace(
    storage: &dyn Storage,
    key: &[u8],
    value: &[u8],
) -> Result<Reply, CombineError> {
    if storage.get(key)?.is_none() {
        return Ok(Reply::NotStored);
    }
    Ok(stored_reply(storage.set(key, value)?))
}

#[derive(Clone, Copy)]
enum Concat {
    Append,
    Prepend,
}

fn execute_concat(
    storage: &dyn Storage,
    key: &[u8],
    value: &[u8],
    which: Concat,
) -> Result<Reply, CombineError> {
    let Some(existing) = storage.get(key)? else {
        return Ok(Reply::NotStored);
    };
    let combined = match which {
        Concat::Append => [existing, value.to_vec()].concat(),
        Concat::Prepend => [value.to_vec(), existing].concat(),
    };
    Ok(stored_reply(storage.set(key, &combined)?))
}

fn execute_get(storage: &dyn Storage, keys: &[Vec<u8>]) -> Reply {
    let mut values = Vec::with_capacity(keys.len());
    for key in keys {
        match storage.get(key) {
            Ok(Some(value)) => values.push(ValueEntry {
                key: key.clone(),
                flags: 0,
                value,
            }),
            Ok(None) => {}
            Err(CombineError::ShutDown) => {
                tracing::warn!("get dropped: combiner has shut down");
                return Reply::CombinerShutDown;
            }
        }
    }
    Reply::Values(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrocache_memory::FlatCombinedStore;

    #[test]
    fn set_always_stores() {
        let store = FlatCombinedStore::new(10);
        let cmd = Command::Set {
            key: b"a".to_vec(),
            value: b"1".to_vec(),
            noreply: false,
        };
        assert_eq!(execute(&cmd, &store), Reply::Stored);
    }

    #[test]
    fn add_refuses_existing_key() {
        let store = FlatCombinedStore::new(10);
        store.put(b"a", b"1").unwrap();
        let cmd = Command::Add {
            key: b"a".to_vec(),
            value: b"2".to_vec(),
            noreply: false,
        };
        assert_eq!(execute(&cmd, &store), Reply::NotStored);
    }

    #[test]
    fn replace_requires_existing_key() {
        let store = FlatCombinedStore::new(10);
        let cmd = Command::Replace {
            key: b"a".to_vec(),
            value: b"2".to_vec(),
            noreply: false,
        };
        assert_eq!(execute(&cmd, &store), Reply::NotStored);

        store.put(b"a", b"1").unwrap();
        assert_eq!(execute(&cmd, &store), Reply::Stored);
        assert_eq!(store.get(b"a").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn append_and_prepend_concatenate_onto_existing_value() {
        let store = FlatCombinedStore::new(10);
        store.put(b"a", b"mid").unwrap();

        let append = Command::Append {
            key: b"a".to_vec(),
            value: b"-end".to_vec(),
            noreply: false,
        };
        assert_eq!(execute(&append, &store), Reply::Stored);
        assert_eq!(store.get(b"a").unwrap(), Some(b"mid-end".to_vec()));

        let prepend = Command::Prepend {
            key: b"a".to_vec(),
            value: b"start-".to_vec(),
            noreply: false,
        };
        assert_eq!(execute(&prepend, &store), Reply::Stored);
        assert_eq!(store.get(b"a").unwrap(), Some(b"start-mid-end".to_vec()));
    }

    #[test]
    fn append_on_missing_key_is_not_stored() {
        let store = FlatCombinedStore::new(10);
        let cmd = Command::Append {
            key: b"missing".to_vec(),
            value: b"x".to_vec(),
            noreply: false,
        };
        assert_eq!(execute(&cmd, &store), Reply::NotStored);
    }

    #[test]
    fn delete_reports_not_found_on_second_call() {
        let store = FlatCombinedStore::new(10);
        store.put(b"a", b"1").unwrap();
        let cmd = Command::Delete {
            key: b"a".to_vec(),
            noreply: false,
        };
        assert_eq!(execute(&cmd, &store), Reply::Deleted);
        assert_eq!(execute(&cmd, &store), Reply::NotFound);
    }

    #[test]
    fn get_returns_only_present_keys() {
        let store = FlatCombinedStore::new(10);
        store.put(b"a", b"1").unwrap();
        let cmd = Command::Get {
            keys: vec![b"a".to_vec(), b"missing".to_vec()],
        };
        assert_eq!(
            execute(&cmd, &store),
            Reply::Values(vec![ValueEntry {
                key: b"a".to_vec(),
                flags: 0,
                value: b"1".to_vec(),
            }])
        );
    }
}
