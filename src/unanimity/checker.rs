//! The crate `checker` inspects a discovery round's responses and reports
//! whether the cluster's committed configuration history is still unanimous.
//!
//! Two kinds of finding exist. A change that some nodes committed and other
//! nodes rolled back means a run died mid-resolution; the cluster holds two
//! configurations under the same change id. Committed histories that diverge
//! without such a half-resolved change mean the nodes were partitioned and
//! accepted different changes. Both findings stop any further mutation.

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

use std::collections::{BTreeMap, BTreeSet};

use crate::types::{ChangeId, ChangeRequestState, DiscoverResponse, NodeAddr};

/// One consistency violation found in a discovery round.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsistencyFinding {
    /// The same change is committed on some nodes and rolled back on others.
    InconsistentChange {
        change_id: ChangeId,
        committed: Vec<NodeAddr>,
        rolled_back: Vec<NodeAddr>,
    },
    /// Committed histories have diverged with no half-resolved change to
    /// explain it: each inner set of nodes agrees internally.
    Partitioned { partitions: Vec<Vec<NodeAddr>> },
}

/// Checks a full round of discovery responses.
///
/// Nodes are grouped by the identity of their latest committed change: by
/// change id, with groups folded together when their committed result
/// hashes match, since equal content under different ids (a change redone
/// after a rollback) is not a divergence. A node that never committed
/// anything joins no group. Prepared changes are in flight and judged by
/// the driver, not here.
pub fn check_cluster_consistency(
    responses: &BTreeMap<NodeAddr, DiscoverResponse>,
) -> Vec<ConsistencyFinding> {
    let mut commits: BTreeMap<ChangeId, BTreeSet<NodeAddr>> = BTreeMap::new();
    let mut rollbacks: BTreeMap<ChangeId, BTreeSet<NodeAddr>> = BTreeMap::new();
    for (addr, response) in responses {
        if let Some(latest) = &response.latest_change {
            match latest.state {
                ChangeRequestState::Committed => {
                    commits.entry(latest.change_id).or_default().insert(addr.clone());
                }
                ChangeRequestState::RolledBack => {
                    rollbacks.entry(latest.change_id).or_default().insert(addr.clone());
                }
                ChangeRequestState::Prepared => {}
            }
        }
    }

    let mut findings = Vec::new();
    for (change_id, committed) in &commits {
        if let Some(rolled_back) = rollbacks.get(change_id) {
            findings.push(ConsistencyFinding::InconsistentChange {
                change_id: *change_id,
                committed: committed.iter().cloned().collect(),
                rolled_back: rolled_back.iter().cloned().collect(),
            });
        }
    }
    if !findings.is_empty() {
        // The divergence below, if any, is explained by the half-resolved
        // changes already reported.
        return findings;
    }

    let mut by_id: BTreeMap<ChangeId, (String, BTreeSet<NodeAddr>)> = BTreeMap::new();
    for (addr, response) in responses {
        if let Some(committed) = &response.latest_committed_change {
            by_id
                .entry(committed.change_id)
                .or_insert_with(|| (committed.result_hash.clone(), BTreeSet::new()))
                .1
                .insert(addr.clone());
        }
    }
    let mut by_content: BTreeMap<String, BTreeSet<NodeAddr>> = BTreeMap::new();
    for (_, (hash, nodes)) in by_id {
        by_content.entry(hash).or_default().extend(nodes);
    }
    if by_content.len() > 1 {
        findings.push(ConsistencyFinding::Partitioned {
            partitions: by_content
                .into_values()
                .map(|nodes| nodes.into_iter().collect())
                .collect(),
        });
    }
    findings
}
