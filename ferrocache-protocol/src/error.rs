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

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed command line: {0:?}")]
    MalformedLine(String),

    #[error("unknown command verb: {0:?}")]
    UnknownVerb(String),

    #[error("command {verb} is missing its {argument} argument")]
    MissingArgument {
        verb: &'static str,
        argument: &'static str,
    },

    #[error("declared payload length {declared} does not fit the {received} bytes received")]
    ByteCountMismatch { declared: usize, received: usize },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
