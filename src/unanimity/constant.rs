//! The crate `constant` defines a set of constants shared by the journal and
//! the node state store.

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

/// Names of the two alternating generation files inside a journal directory.
pub const GENERATION_FILES: [&str; 2] = ["gen-0", "gen-1"];

/// Name of the pointer file recording the authoritative generation and its
/// trailing chain hash.
pub const POINTER_FILE: &str = "pointer";

/// Name of the temporary file the pointer is staged in before rename.
pub const POINTER_TMP_FILE: &str = "pointer.tmp";

/// Name of the lock file guarding a journal directory against concurrent
/// opens.
pub const LOCK_FILE: &str = "journal.lock";

/// Key of the node mode field in the state store.
pub const MODE_KEY: &str = "mode";

/// Key of the mutative message counter in the state store.
pub const MUTATIVE_MESSAGE_COUNT_KEY: &str = "mutativeMessageCount";

/// Key of the host that issued the last applied mutative message.
pub const LAST_MUTATION_HOST_KEY: &str = "lastMutationHost";

/// Key of the user that issued the last applied mutative message.
pub const LAST_MUTATION_USER_KEY: &str = "lastMutationUser";

/// Key of the timestamp of the last applied mutative message.
pub const LAST_MUTATION_TIMESTAMP_KEY: &str = "lastMutationTimestamp";

/// Key of the most recently proposed change id.
pub const LATEST_CHANGE_ID_KEY: &str = "latestChangeId";

/// Key of the configuration version currently in force.
pub const CURRENT_VERSION_KEY: &str = "currentVersion";

/// Key of the highest configuration version ever prepared.
pub const HIGHEST_VERSION_KEY: &str = "highestVersion";

/// Prefix of the per-change record keys in the state store.
pub const CHANGE_KEY_PREFIX: &str = "change-";

/// A helper function building the state-store key of one change record.
pub fn change_key(change_id: &str) -> String {
    format!("{}{}", CHANGE_KEY_PREFIX, change_id)
}
