//! The crate `types` defines the data model shared by the node state machine,
//! the consistency checker and the protocol driver.

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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Globally unique identifier of one configuration change, minted by the
/// client that starts the change and carried through prepare, commit and
/// rollback on every node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ChangeId(Uuid);

impl ChangeId {
    pub fn new() -> ChangeId {
        ChangeId(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<ChangeId> {
        Uuid::parse_str(s).ok().map(ChangeId)
    }
}

impl Default for ChangeId {
    fn default() -> ChangeId {
        ChangeId::new()
    }
}

impl std::fmt::Display for ChangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for ChangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of one node endpoint. Kept unresolved so the transport layer
/// decides how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(host: &str, port: u16) -> NodeAddr {
        NodeAddr {
            host: host.to_string(),
            port,
        }
    }
}

impl std::fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The opaque payload being proposed: a named operation plus a human
/// readable summary. The protocol never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChange {
    pub operation: String,
    pub summary: String,
}

impl ConfigChange {
    pub fn new(operation: &str, summary: &str) -> ConfigChange {
        ConfigChange {
            operation: operation.to_string(),
            summary: summary.to_string(),
        }
    }
}

/// Lifecycle of one change on one node. `Prepared` is the only non-terminal
/// state and must resolve to `Committed` or `RolledBack` before the node
/// accepts another prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeRequestState {
    Prepared,
    Committed,
    RolledBack,
}

impl std::fmt::Display for ChangeRequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ChangeRequestState::Prepared => "PREPARED",
            ChangeRequestState::Committed => "COMMITTED",
            ChangeRequestState::RolledBack => "ROLLED_BACK",
        };
        write!(f, "{}", text)
    }
}

/// Mode of a node: `Accepting` when no change is outstanding, `Prepared`
/// while one prepared change awaits commit or rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeMode {
    Accepting,
    Prepared,
}

impl std::fmt::Display for NodeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            NodeMode::Accepting => "ACCEPTING",
            NodeMode::Prepared => "PREPARED",
        };
        write!(f, "{}", text)
    }
}

impl std::str::FromStr for NodeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<NodeMode, String> {
        match s {
            "ACCEPTING" => Ok(NodeMode::Accepting),
            "PREPARED" => Ok(NodeMode::Prepared),
            other => Err(format!("unknown node mode: {}", other)),
        }
    }
}

/// Why a node rejected a mutative message.
///
/// - `Unacceptable`: the change failed node-local validation.
/// - `Dead`: the caller's view of the node is stale, another client mutated
///   the node since the caller's discovery.
/// - `Bad`: the message contradicts the node's state machine, which points
///   at a defective caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    Unacceptable,
    Dead,
    Bad,
}

/// One historical change entry as exposed in a discovery snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDetails {
    pub change_id: ChangeId,
    pub state: ChangeRequestState,
    pub version: u64,
    pub change: ConfigChange,
    pub change_result: String,
    pub creation_host: String,
    pub creation_user: String,
    pub creation_timestamp: DateTime<Utc>,
    /// Content hash of `change_result`, used for cross-node equality
    /// comparison without shipping full payloads.
    pub result_hash: String,
}

/// Snapshot of one node's state, returned by `discover`.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverResponse {
    pub mode: NodeMode,
    pub mutative_message_count: u64,
    pub last_mutation_host: Option<String>,
    pub last_mutation_user: Option<String>,
    pub last_mutation_timestamp: Option<DateTime<Utc>>,
    pub current_version: u64,
    pub highest_version: u64,
    /// Whatever change is most recent, prepared or resolved.
    pub latest_change: Option<ChangeDetails>,
    /// The latest committed change; equals `latest_change` when that one is
    /// already committed, `None` when nothing has ever committed.
    pub latest_committed_change: Option<ChangeDetails>,
}

impl std::fmt::Debug for DiscoverResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoverResponse")
            .field("mode", &self.mode)
            .field("mutative_message_count", &self.mutative_message_count)
            .field("current_version", &self.current_version)
            .field("highest_version", &self.highest_version)
            .field("latest_change", &self.latest_change.as_ref().map(|c| c.change_id))
            .field(
                "latest_committed_change",
                &self.latest_committed_change.as_ref().map(|c| c.change_id),
            )
            .finish()
    }
}

/// Fields common to every mutative message: the optimistic concurrency
/// guard plus the identity of the issuing client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutativeHeader {
    /// The node's `mutative_message_count` as last seen by the caller. A
    /// mismatch means another client mutated the node in between and the
    /// message is rejected `Dead`.
    pub expected_mutative_message_count: u64,
    pub mutation_host: String,
    pub mutation_user: String,
    pub mutation_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepareMessage {
    pub header: MutativeHeader,
    pub change_id: ChangeId,
    pub version_number: u64,
    pub change: ConfigChange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitMessage {
    pub header: MutativeHeader,
    pub change_id: ChangeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackMessage {
    pub header: MutativeHeader,
    pub change_id: ChangeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TakeoverMessage {
    pub header: MutativeHeader,
}

/// A node's answer to a mutative message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AcceptRejectResponse {
    Accept,
    Reject {
        reason: RejectionReason,
        message: String,
        /// Identity of the client whose mutation the node saw last, so a
        /// rejected caller can name who got in the way.
        last_mutation_host: Option<String>,
        last_mutation_user: Option<String>,
    },
}

impl AcceptRejectResponse {
    pub fn accept() -> AcceptRejectResponse {
        AcceptRejectResponse::Accept
    }

    pub fn reject(
        reason: RejectionReason,
        message: &str,
        last_mutation_host: Option<String>,
        last_mutation_user: Option<String>,
    ) -> AcceptRejectResponse {
        AcceptRejectResponse::Reject {
            reason,
            message: message.to_string(),
            last_mutation_host,
            last_mutation_user,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, AcceptRejectResponse::Accept)
    }

    pub fn rejection_reason(&self) -> Option<RejectionReason> {
        match self {
            AcceptRejectResponse::Accept => None,
            AcceptRejectResponse::Reject { reason, .. } => Some(*reason),
        }
    }
}

/// Overall outcome of one protocol run across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    /// Every node resolved the change identically.
    Consistent,
    /// Some nodes resolved and some did not; a recovery run is required.
    MayNeedRecovery,
    /// The run aborted before any mutation, so the cluster is unchanged
    /// even though its state could not be fully determined.
    UnknownButNoChange,
    /// The same change is committed on some nodes and rolled back on
    /// others. Operator intervention is required.
    UnrecoverablyInconsistent,
    /// Nodes have permanently diverged committed histories. Operator
    /// intervention is required.
    UnrecoverablyPartitioned,
}

/// Content hash used in `ChangeDetails::result_hash`, rendered as lowercase
/// hex.
pub fn result_hash(result: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(result.as_bytes());
    hex::encode(hasher.finalize())
}
