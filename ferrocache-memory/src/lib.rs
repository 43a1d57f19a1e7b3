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

//! The bounded LRU store and the flat-combining synchronization primitive that makes it safe
//! to share across threads without a global mutex.

pub mod combiner;
pub mod lru;
pub mod store;

pub use combiner::FlatCombiner;
pub use lru::LruStore;
pub use store::{FlatCombinedStore, Op, OpResult};
