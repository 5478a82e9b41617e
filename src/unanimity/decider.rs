//! The crate `decider` turns per-phase outcomes into go/no-go decisions and
//! the run's final [`Consistency`] verdict.
//!
//! The driver collects each phase's results into an immutable outcome value
//! and hands it to the pure functions here; no decision state is shared
//! between phases.

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

use crate::types::{
    ChangeDetails, ChangeId, ChangeRequestState, Consistency, DiscoverResponse, NodeAddr, NodeMode,
};

/// Result of one discovery round.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOutcome {
    responses: BTreeMap<NodeAddr, DiscoverResponse>,
    failed: BTreeSet<NodeAddr>,
    other_clients: BTreeSet<NodeAddr>,
}

impl DiscoveryOutcome {
    pub fn new() -> DiscoveryOutcome {
        DiscoveryOutcome::default()
    }

    pub fn record_response(&mut self, endpoint: NodeAddr, response: DiscoverResponse) {
        self.responses.insert(endpoint, response);
    }

    pub fn record_failure(&mut self, endpoint: NodeAddr) {
        self.failed.insert(endpoint);
    }

    /// Marks a node whose mutative message count moved between the two
    /// discovery rounds: another client is active there.
    pub fn record_other_client(&mut self, endpoint: NodeAddr) {
        self.other_clients.insert(endpoint);
    }

    /// True when every node answered and none showed another client's hand.
    pub fn is_successful(&self) -> bool {
        self.failed.is_empty() && self.other_clients.is_empty()
    }

    pub fn responses(&self) -> &BTreeMap<NodeAddr, DiscoverResponse> {
        &self.responses
    }

    pub fn response_for(&self, endpoint: &NodeAddr) -> Option<&DiscoverResponse> {
        self.responses.get(endpoint)
    }

    pub fn all_accepting(&self) -> bool {
        self.responses
            .values()
            .all(|r| r.mode == NodeMode::Accepting)
    }

    /// Nodes sitting in `Prepared` mode, with the change each is holding.
    pub fn prepared_nodes(&self) -> Vec<(NodeAddr, ChangeDetails)> {
        self.responses
            .iter()
            .filter(|(_, r)| r.mode == NodeMode::Prepared)
            .filter_map(|(addr, r)| r.latest_change.clone().map(|c| (addr.clone(), c)))
            .collect()
    }

    pub fn max_highest_version(&self) -> u64 {
        self.responses
            .values()
            .map(|r| r.highest_version)
            .max()
            .unwrap_or(0)
    }

    pub fn mutative_message_count(&self, endpoint: &NodeAddr) -> Option<u64> {
        self.responses
            .get(endpoint)
            .map(|r| r.mutative_message_count)
    }
}

/// Result of one mutative phase: prepare, takeover, commit or rollback.
/// A node lands in `failed` on transport failure, timeout or rejection.
#[derive(Debug, Clone, Default)]
pub struct PhaseOutcome {
    accepted: BTreeSet<NodeAddr>,
    failed: BTreeSet<NodeAddr>,
}

impl PhaseOutcome {
    pub fn new() -> PhaseOutcome {
        PhaseOutcome::default()
    }

    pub fn record_accepted(&mut self, endpoint: NodeAddr) {
        self.accepted.insert(endpoint);
    }

    pub fn record_failed(&mut self, endpoint: NodeAddr) {
        self.failed.insert(endpoint);
    }

    pub fn accepted(&self) -> &BTreeSet<NodeAddr> {
        &self.accepted
    }

    pub fn all_accepted(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Verdict of a commit or rollback phase: unanimity resolves the run, any
/// straggler leaves the cluster needing recovery.
pub fn resolution_verdict(outcome: &PhaseOutcome) -> Consistency {
    if outcome.all_accepted() {
        Consistency::Consistent
    } else {
        Consistency::MayNeedRecovery
    }
}

/// How a recovery run should resolve the in-flight change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    Commit,
    Rollback,
    CannotDecide,
}

/// Decides commit versus rollback for the change held by the prepared nodes.
///
/// A node that already resolved the same change is direct evidence and wins.
/// With no evidence: an explicit `forced_state` pins the answer; otherwise
/// rollback is safe only when every expected node was discovered, since an
/// unreached node could be holding a commit.
pub fn recovery_decision(
    discovery: &DiscoveryOutcome,
    prepared: &[(NodeAddr, ChangeDetails)],
    expected_node_count: usize,
    forced_state: Option<ChangeRequestState>,
) -> RecoveryDecision {
    let ids: BTreeSet<ChangeId> = prepared.iter().map(|(_, c)| c.change_id).collect();
    let change_id = match ids.iter().next() {
        Some(id) if ids.len() == 1 => *id,
        _ => return RecoveryDecision::CannotDecide,
    };

    let mut committed = false;
    let mut rolled_back = false;
    for response in discovery.responses().values() {
        if let Some(latest) = &response.latest_change {
            if latest.change_id == change_id {
                match latest.state {
                    ChangeRequestState::Committed => committed = true,
                    ChangeRequestState::RolledBack => rolled_back = true,
                    ChangeRequestState::Prepared => {}
                }
            }
        }
    }
    if committed && rolled_back {
        return RecoveryDecision::CannotDecide;
    }
    if committed {
        return RecoveryDecision::Commit;
    }
    if rolled_back {
        return RecoveryDecision::Rollback;
    }

    match forced_state {
        Some(ChangeRequestState::Committed) => RecoveryDecision::Commit,
        Some(ChangeRequestState::RolledBack) => RecoveryDecision::Rollback,
        Some(ChangeRequestState::Prepared) => RecoveryDecision::CannotDecide,
        None if discovery.responses().len() == expected_node_count => RecoveryDecision::Rollback,
        None => RecoveryDecision::CannotDecide,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::types::{result_hash, ConfigChange};

    fn addr(name: &str) -> NodeAddr {
        NodeAddr::new(name, 9410)
    }

    fn details(change_id: ChangeId, state: ChangeRequestState) -> ChangeDetails {
        ChangeDetails {
            change_id,
            state,
            version: 1,
            change: ConfigChange::new("set", "offheap=2GB"),
            change_result: "cfg".to_string(),
            creation_host: "host-a".to_string(),
            creation_user: "alice".to_string(),
            creation_timestamp: Utc::now(),
            result_hash: result_hash("cfg"),
        }
    }

    fn response(mode: NodeMode, highest_version: u64, latest: Option<ChangeDetails>) -> DiscoverResponse {
        DiscoverResponse {
            mode,
            mutative_message_count: 1,
            last_mutation_host: None,
            last_mutation_user: None,
            last_mutation_timestamp: None,
            current_version: 0,
            highest_version,
            latest_change: latest,
            latest_committed_change: None,
        }
    }

    fn discovery(nodes: Vec<(NodeAddr, DiscoverResponse)>) -> DiscoveryOutcome {
        let mut outcome = DiscoveryOutcome::new();
        for (addr, response) in nodes {
            outcome.record_response(addr, response);
        }
        outcome
    }

    #[test]
    fn discovery_fails_on_unreachable_or_other_client() {
        let mut outcome = discovery(vec![(
            addr("node-a"),
            response(NodeMode::Accepting, 0, None),
        )]);
        assert!(outcome.is_successful());
        outcome.record_failure(addr("node-b"));
        assert!(!outcome.is_successful());

        let mut outcome = discovery(vec![(
            addr("node-a"),
            response(NodeMode::Accepting, 0, None),
        )]);
        outcome.record_other_client(addr("node-a"));
        assert!(!outcome.is_successful());
    }

    #[test]
    fn prepared_node_breaks_all_accepting() {
        let change = details(ChangeId::new(), ChangeRequestState::Prepared);
        let outcome = discovery(vec![
            (addr("node-a"), response(NodeMode::Accepting, 1, None)),
            (
                addr("node-b"),
                response(NodeMode::Prepared, 2, Some(change.clone())),
            ),
        ]);
        assert!(!outcome.all_accepting());
        let prepared = outcome.prepared_nodes();
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].0, addr("node-b"));
        assert_eq!(prepared[0].1.change_id, change.change_id);
        assert_eq!(outcome.max_highest_version(), 2);
    }

    #[test]
    fn resolution_verdict_needs_unanimity() {
        let mut outcome = PhaseOutcome::new();
        outcome.record_accepted(addr("node-a"));
        outcome.record_accepted(addr("node-b"));
        assert_eq!(resolution_verdict(&outcome), Consistency::Consistent);

        outcome.record_failed(addr("node-c"));
        assert_eq!(resolution_verdict(&outcome), Consistency::MayNeedRecovery);
    }

    #[test]
    fn recovery_commits_when_change_committed_somewhere() {
        let change_id = ChangeId::new();
        let outcome = discovery(vec![
            (
                addr("node-a"),
                response(
                    NodeMode::Prepared,
                    1,
                    Some(details(change_id, ChangeRequestState::Prepared)),
                ),
            ),
            (
                addr("node-b"),
                response(
                    NodeMode::Accepting,
                    1,
                    Some(details(change_id, ChangeRequestState::Committed)),
                ),
            ),
        ]);
        let prepared = outcome.prepared_nodes();
        assert_eq!(
            recovery_decision(&outcome, &prepared, 2, None),
            RecoveryDecision::Commit
        );
    }

    #[test]
    fn recovery_rolls_back_when_change_rolled_back_somewhere() {
        let change_id = ChangeId::new();
        let outcome = discovery(vec![
            (
                addr("node-a"),
                response(
                    NodeMode::Prepared,
                    1,
                    Some(details(change_id, ChangeRequestState::Prepared)),
                ),
            ),
            (
                addr("node-b"),
                response(
                    NodeMode::Accepting,
                    1,
                    Some(details(change_id, ChangeRequestState::RolledBack)),
                ),
            ),
        ]);
        let prepared = outcome.prepared_nodes();
        assert_eq!(
            recovery_decision(&outcome, &prepared, 2, None),
            RecoveryDecision::Rollback
        );
    }

    #[test]
    fn recovery_rolls_back_prepared_only_cluster_with_full_visibility() {
        let change_id = ChangeId::new();
        let prepared_response = |name: &str| {
            (
                addr(name),
                response(
                    NodeMode::Prepared,
                    1,
                    Some(details(change_id, ChangeRequestState::Prepared)),
                ),
            )
        };
        let outcome = discovery(vec![prepared_response("node-a"), prepared_response("node-b")]);
        let prepared = outcome.prepared_nodes();
        assert_eq!(
            recovery_decision(&outcome, &prepared, 2, None),
            RecoveryDecision::Rollback
        );
    }

    #[test]
    fn recovery_cannot_decide_with_missing_nodes_and_no_evidence() {
        let change_id = ChangeId::new();
        let outcome = discovery(vec![(
            addr("node-a"),
            response(
                NodeMode::Prepared,
                1,
                Some(details(change_id, ChangeRequestState::Prepared)),
            ),
        )]);
        let prepared = outcome.prepared_nodes();
        assert_eq!(
            recovery_decision(&outcome, &prepared, 2, None),
            RecoveryDecision::CannotDecide
        );
    }

    #[test]
    fn forced_state_pins_the_answer_without_evidence() {
        let change_id = ChangeId::new();
        let outcome = discovery(vec![(
            addr("node-a"),
            response(
                NodeMode::Prepared,
                1,
                Some(details(change_id, ChangeRequestState::Prepared)),
            ),
        )]);
        let prepared = outcome.prepared_nodes();
        assert_eq!(
            recovery_decision(&outcome, &prepared, 2, Some(ChangeRequestState::Committed)),
            RecoveryDecision::Commit
        );
        assert_eq!(
            recovery_decision(&outcome, &prepared, 2, Some(ChangeRequestState::RolledBack)),
            RecoveryDecision::Rollback
        );
    }

    #[test]
    fn direct_evidence_beats_forced_state() {
        let change_id = ChangeId::new();
        let outcome = discovery(vec![
            (
                addr("node-a"),
                response(
                    NodeMode::Prepared,
                    1,
                    Some(details(change_id, ChangeRequestState::Prepared)),
                ),
            ),
            (
                addr("node-b"),
                response(
                    NodeMode::Accepting,
                    1,
                    Some(details(change_id, ChangeRequestState::Committed)),
                ),
            ),
        ]);
        let prepared = outcome.prepared_nodes();
        assert_eq!(
            recovery_decision(&outcome, &prepared, 2, Some(ChangeRequestState::RolledBack)),
            RecoveryDecision::Commit
        );
    }

    #[test]
    fn mixed_prepared_change_ids_cannot_be_decided() {
        let outcome = discovery(vec![
            (
                addr("node-a"),
                response(
                    NodeMode::Prepared,
                    1,
                    Some(details(ChangeId::new(), ChangeRequestState::Prepared)),
                ),
            ),
            (
                addr("node-b"),
                response(
                    NodeMode::Prepared,
                    1,
                    Some(details(ChangeId::new(), ChangeRequestState::Prepared)),
                ),
            ),
        ]);
        let prepared = outcome.prepared_nodes();
        assert_eq!(
            recovery_decision(&outcome, &prepared, 2, None),
            RecoveryDecision::CannotDecide
        );
    }
}
