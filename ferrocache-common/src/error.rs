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

use thiserror::Error;

/// Failure handed back to a thread whose operation was submitted to a flat combiner that got
/// torn down before the combiner could run it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CombineError {
    #[error("flat combiner was shut down before this operation was executed")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, CombineError>;
