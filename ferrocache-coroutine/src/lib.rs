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

//! A single-threaded cooperative scheduler that multiplexes many logical tasks onto one OS
//! thread by copying each suspended task's live stack region into a heap buffer and restoring
//! it on resume (§4.3). Used by the non-blocking dispatcher to interleave client sessions
//! without a thread per connection.

mod engine;

pub use engine::{Engine, TaskHandle};
