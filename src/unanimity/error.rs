// Copyright 2021 The sdcons Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// Another process holds the exclusive lock on the journal directory.
    #[error("journal directory is locked by another process")]
    LockHeld,

    /// The journal's on-disk state is ambiguous or fails hash verification.
    /// The node refuses to start rather than guess at its history.
    #[error("journal is corrupt: {detail}")]
    Corrupt { detail: String },

    #[error("broken io request")]
    Io(Arc<std::io::Error>),

    /// A node did not answer within the configured deadline. Treated the
    /// same as an unreachable node by the protocol driver.
    #[error("no response from node within the deadline")]
    Timeout,

    /// A node answered with a transport-level failure.
    #[error("remote call failed: {0}")]
    Remote(String),

    #[error("malformed payload: {0}")]
    Codec(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Error {
        Error::Codec(err.to_string())
    }
}
