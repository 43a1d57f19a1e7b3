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

//! Text command parsing and dispatch for the memcached-style protocol surface (§6). Transport
//! itself lives in `ferrocache-server`; this crate only turns bytes into [`Command`]s and
//! [`Command`]s into [`Reply`]s.

mod command;
mod error;
mod parser;

pub use command::{execute, Command, Reply, Storage, ValueEntry};
pub use error::{ProtocolError, Result};
pub use parser::{parse_line, ParsedLine, PendingPayload};
