//! The crate `client` drives one protocol run against the cluster: two
//! rounds of discovery, a consistency check, then prepare plus commit or
//! rollback for a new change, or takeover plus commit or rollback for the
//! recovery of an abandoned one.
//!
//! Each phase fans its RPC out to every target node on its own thread and
//! gathers answers over a channel until a deadline; a node that misses the
//! deadline is treated as unreachable. Phases are strictly sequential. A
//! run never returns an error: every per-node failure is reported through
//! the event stream and folded into the final [`Consistency`] verdict.

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
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::debug;

use crate::checker::{check_cluster_consistency, ConsistencyFinding};
use crate::decider::{
    recovery_decision, resolution_verdict, DiscoveryOutcome, PhaseOutcome, RecoveryDecision,
};
use crate::error::Error;
use crate::events::{Event, EventSink};
use crate::types::{
    AcceptRejectResponse, ChangeId, ChangeRequestState, CommitMessage, ConfigChange, Consistency,
    DiscoverResponse, MutativeHeader, NodeAddr, PrepareMessage, RejectionReason, RollbackMessage,
    TakeoverMessage,
};

/// The RPC seam to one node; the transport behind it is external.
pub trait NodeHandle: Send + Sync {
    fn discover(&self) -> Result<DiscoverResponse, Error>;
    fn prepare(&self, message: PrepareMessage) -> Result<AcceptRejectResponse, Error>;
    fn commit(&self, message: CommitMessage) -> Result<AcceptRejectResponse, Error>;
    fn rollback(&self, message: RollbackMessage) -> Result<AcceptRejectResponse, Error>;
    fn takeover(&self, message: TakeoverMessage) -> Result<AcceptRejectResponse, Error>;
}

/// One target node: its address and the handle to reach it.
#[derive(Clone)]
pub struct NodeEndpoint {
    addr: NodeAddr,
    handle: Arc<dyn NodeHandle>,
}

impl NodeEndpoint {
    pub fn new(addr: NodeAddr, handle: Arc<dyn NodeHandle>) -> NodeEndpoint {
        NodeEndpoint { addr, handle }
    }

    pub fn addr(&self) -> &NodeAddr {
        &self.addr
    }
}

impl std::fmt::Debug for NodeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeEndpoint").field("addr", &self.addr).finish()
    }
}

/// Knobs of the protocol driver.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// How long a phase waits for node answers before treating the silent
    /// nodes as unreachable. Default: 5 seconds.
    pub rpc_timeout: Duration,
    /// Host recorded on nodes as the origin of this client's mutations.
    /// Default: `$HOSTNAME`, or "unknown" when unset.
    pub host: String,
    /// User recorded on nodes as the origin of this client's mutations.
    /// Default: `$USER`, or "unknown" when unset.
    pub user: String,
}

impl Default for ClientOptions {
    fn default() -> ClientOptions {
        ClientOptions {
            rpc_timeout: Duration::from_secs(5),
            host: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            user: std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
        }
    }
}

/// Drives protocol runs against a fixed set of node endpoints. Each run is
/// independent; cross-run coordination happens only through the nodes'
/// mutative message counts.
#[derive(Debug)]
pub struct Client {
    endpoints: Vec<NodeEndpoint>,
    options: ClientOptions,
}

impl Client {
    pub fn new(endpoints: Vec<NodeEndpoint>, options: ClientOptions) -> Client {
        Client { endpoints, options }
    }

    /// Runs a full change: discovery twice, consistency check, prepare on
    /// every node, then commit (all prepared) or rollback (sent only to the
    /// nodes that accepted the prepare).
    pub fn try_apply_change(&self, sink: &mut dyn EventSink, change: ConfigChange) -> Consistency {
        let verdict = self.run_change(sink, change);
        sink.send(Event::Done {
            consistency: verdict,
        });
        verdict
    }

    /// Resolves an abandoned in-flight change: discovery twice, consistency
    /// check, takeover of every node, then commit or rollback of the
    /// prepared nodes. `expected_node_count` is the full cluster size; with
    /// nodes missing and no evidence either way, only a `forced_state` can
    /// settle the decision.
    pub fn try_recovery(
        &self,
        sink: &mut dyn EventSink,
        expected_node_count: usize,
        forced_state: Option<ChangeRequestState>,
    ) -> Consistency {
        let verdict = self.run_recovery(sink, expected_node_count, forced_state);
        sink.send(Event::Done {
            consistency: verdict,
        });
        verdict
    }

    fn run_change(&self, sink: &mut dyn EventSink, change: ConfigChange) -> Consistency {
        sink.send(Event::StartDiscovery {
            endpoints: self.addrs(),
        });
        let first = self.discover_round(sink, None);
        sink.send(Event::EndDiscovery);
        if !first.is_successful() {
            return Consistency::UnknownButNoChange;
        }

        let already_prepared = first.prepared_nodes();
        if !already_prepared.is_empty() {
            for (endpoint, details) in already_prepared {
                sink.send(Event::DiscoverAlreadyPrepared {
                    endpoint,
                    change_id: details.change_id,
                    creation_host: details.creation_host,
                    creation_user: details.creation_user,
                });
            }
            return Consistency::UnknownButNoChange;
        }

        let second = match self.verified_second_round(sink, &first) {
            Ok(second) => second,
            Err(verdict) => return verdict,
        };

        let change_id = ChangeId::new();
        let version = second.max_highest_version() + 1;
        let counts = counts_of(&second);
        debug!(
            "starting change {} at version {} across {} nodes",
            change_id,
            version,
            self.endpoints.len()
        );

        sink.send(Event::StartPrepare { change_id });
        let results = {
            let counts = counts.clone();
            let host = self.options.host.clone();
            let user = self.options.user.clone();
            self.fan_out(&self.endpoints, move |addr, handle| {
                handle.prepare(PrepareMessage {
                    header: header_for(&counts, addr, 0, &host, &user),
                    change_id,
                    version_number: version,
                    change: change.clone(),
                })
            })
        };
        let prepare = collect_phase(sink, results, &prepare_events());
        sink.send(Event::EndPrepare);

        if prepare.all_accepted() {
            let outcome = self.commit_phase(sink, &self.endpoints, &counts, change_id);
            resolution_verdict(&outcome)
        } else {
            let targets = self.endpoints_among(prepare.accepted());
            let outcome = self.rollback_phase(sink, &targets, &counts, change_id);
            resolution_verdict(&outcome)
        }
    }

    fn run_recovery(
        &self,
        sink: &mut dyn EventSink,
        expected_node_count: usize,
        forced_state: Option<ChangeRequestState>,
    ) -> Consistency {
        sink.send(Event::StartDiscovery {
            endpoints: self.addrs(),
        });
        let first = self.discover_round(sink, None);
        sink.send(Event::EndDiscovery);
        if !first.is_successful() {
            return Consistency::UnknownButNoChange;
        }

        let second = match self.verified_second_round(sink, &first) {
            Ok(second) => second,
            Err(verdict) => return verdict,
        };

        let prepared = second.prepared_nodes();
        if prepared.is_empty() {
            debug!("no node holds an in-flight change, nothing to recover");
            return Consistency::Consistent;
        }
        let counts = counts_of(&second);

        sink.send(Event::StartTakeover);
        let results = {
            let counts = counts.clone();
            let host = self.options.host.clone();
            let user = self.options.user.clone();
            self.fan_out(&self.endpoints, move |addr, handle| {
                handle.takeover(TakeoverMessage {
                    header: header_for(&counts, addr, 0, &host, &user),
                })
            })
        };
        let takeover = collect_phase(sink, results, &takeover_events());
        sink.send(Event::EndTakeover);
        if !takeover.all_accepted() {
            return Consistency::MayNeedRecovery;
        }

        let change_id = prepared[0].1.change_id;
        let targets = self.endpoints_among(&prepared.iter().map(|(a, _)| a.clone()).collect());
        match recovery_decision(&second, &prepared, expected_node_count, forced_state) {
            RecoveryDecision::Commit => {
                let outcome = self.commit_phase(sink, &targets, &counts, change_id);
                resolution_verdict(&outcome)
            }
            RecoveryDecision::Rollback => {
                let outcome = self.rollback_phase(sink, &targets, &counts, change_id);
                resolution_verdict(&outcome)
            }
            RecoveryDecision::CannotDecide => {
                sink.send(Event::CannotDecideOverCommitOrRollback);
                Consistency::MayNeedRecovery
            }
        }
    }

    /// One discovery round. With a prior round given, each node's mutative
    /// message count must match its earlier answer; movement means another
    /// client is active on that node.
    fn discover_round(
        &self,
        sink: &mut dyn EventSink,
        prior: Option<&DiscoveryOutcome>,
    ) -> DiscoveryOutcome {
        let results = self.fan_out(&self.endpoints, |_, handle| handle.discover());
        let mut outcome = DiscoveryOutcome::new();
        for (addr, result) in results {
            match result {
                Ok(response) => {
                    match prior {
                        None => sink.send(Event::Discovered {
                            endpoint: addr.clone(),
                        }),
                        Some(prior) => {
                            if prior.mutative_message_count(&addr)
                                == Some(response.mutative_message_count)
                            {
                                sink.send(Event::DiscoverRepeated {
                                    endpoint: addr.clone(),
                                });
                            } else {
                                sink.send(Event::DiscoverOtherClient {
                                    endpoint: addr.clone(),
                                    last_mutation_host: response
                                        .last_mutation_host
                                        .clone()
                                        .unwrap_or_default(),
                                    last_mutation_user: response
                                        .last_mutation_user
                                        .clone()
                                        .unwrap_or_default(),
                                });
                                outcome.record_other_client(addr.clone());
                            }
                        }
                    }
                    outcome.record_response(addr, response);
                }
                Err(e) => {
                    sink.send(Event::DiscoverFail {
                        endpoint: addr.clone(),
                        reason: e.to_string(),
                    });
                    outcome.record_failure(addr);
                }
            }
        }
        outcome
    }

    /// Second discovery plus the consistency check over its responses.
    /// Returns the aborting verdict when the round fails or findings exist.
    fn verified_second_round(
        &self,
        sink: &mut dyn EventSink,
        first: &DiscoveryOutcome,
    ) -> Result<DiscoveryOutcome, Consistency> {
        sink.send(Event::StartSecondDiscovery);
        let second = self.discover_round(sink, Some(first));
        sink.send(Event::EndSecondDiscovery);
        if !second.is_successful() {
            return Err(Consistency::UnknownButNoChange);
        }

        let findings = check_cluster_consistency(second.responses());
        if findings.is_empty() {
            return Ok(second);
        }
        let mut verdict = Consistency::UnrecoverablyPartitioned;
        for finding in findings {
            match finding {
                ConsistencyFinding::InconsistentChange {
                    change_id,
                    committed,
                    rolled_back,
                } => {
                    verdict = Consistency::UnrecoverablyInconsistent;
                    sink.send(Event::DiscoverConfigInconsistent {
                        change_id,
                        committed,
                        rolled_back,
                    });
                }
                ConsistencyFinding::Partitioned { partitions } => {
                    sink.send(Event::DiscoverConfigPartitioned { partitions });
                }
            }
        }
        Err(verdict)
    }

    fn commit_phase(
        &self,
        sink: &mut dyn EventSink,
        targets: &[NodeEndpoint],
        counts: &BTreeMap<NodeAddr, u64>,
        change_id: ChangeId,
    ) -> PhaseOutcome {
        sink.send(Event::StartCommit);
        let results = {
            let counts = counts.clone();
            let host = self.options.host.clone();
            let user = self.options.user.clone();
            self.fan_out(targets, move |addr, handle| {
                handle.commit(CommitMessage {
                    header: header_for(&counts, addr, 1, &host, &user),
                    change_id,
                })
            })
        };
        let outcome = collect_phase(sink, results, &commit_events());
        sink.send(Event::EndCommit);
        outcome
    }

    fn rollback_phase(
        &self,
        sink: &mut dyn EventSink,
        targets: &[NodeEndpoint],
        counts: &BTreeMap<NodeAddr, u64>,
        change_id: ChangeId,
    ) -> PhaseOutcome {
        sink.send(Event::StartRollback);
        let results = {
            let counts = counts.clone();
            let host = self.options.host.clone();
            let user = self.options.user.clone();
            self.fan_out(targets, move |addr, handle| {
                handle.rollback(RollbackMessage {
                    header: header_for(&counts, addr, 1, &host, &user),
                    change_id,
                })
            })
        };
        let outcome = collect_phase(sink, results, &rollback_events());
        sink.send(Event::EndRollback);
        outcome
    }

    /// Calls every target on its own thread and gathers answers until the
    /// deadline, in target order. A missing answer becomes `Error::Timeout`.
    /// Worker threads are detached so a wedged node cannot hang the run.
    fn fan_out<R, F>(
        &self,
        targets: &[NodeEndpoint],
        call: F,
    ) -> Vec<(NodeAddr, Result<R, Error>)>
    where
        R: Send + 'static,
        F: Fn(&NodeAddr, &dyn NodeHandle) -> Result<R, Error> + Send + Sync + 'static,
    {
        let call = Arc::new(call);
        let (tx, rx) = mpsc::channel();
        for endpoint in targets {
            let tx = tx.clone();
            let addr = endpoint.addr.clone();
            let handle = Arc::clone(&endpoint.handle);
            let call = Arc::clone(&call);
            thread::spawn(move || {
                let result = call(&addr, handle.as_ref());
                let _ = tx.send((addr, result));
            });
        }
        drop(tx);

        let deadline = Instant::now() + self.options.rpc_timeout;
        let mut answers: BTreeMap<NodeAddr, Result<R, Error>> = BTreeMap::new();
        while answers.len() < targets.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok((addr, result)) => {
                    answers.insert(addr, result);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        targets
            .iter()
            .map(|endpoint| {
                let result = answers
                    .remove(&endpoint.addr)
                    .unwrap_or(Err(Error::Timeout));
                (endpoint.addr.clone(), result)
            })
            .collect()
    }

    fn endpoints_among(&self, members: &BTreeSet<NodeAddr>) -> Vec<NodeEndpoint> {
        self.endpoints
            .iter()
            .filter(|e| members.contains(&e.addr))
            .cloned()
            .collect()
    }

    fn addrs(&self) -> Vec<NodeAddr> {
        self.endpoints.iter().map(|e| e.addr.clone()).collect()
    }
}

fn counts_of(discovery: &DiscoveryOutcome) -> BTreeMap<NodeAddr, u64> {
    discovery
        .responses()
        .iter()
        .map(|(addr, r)| (addr.clone(), r.mutative_message_count))
        .collect()
}

/// Builds a mutative header for one node. `bump` is the number of mutations
/// this run has already applied to the node since its discovered count.
fn header_for(
    counts: &BTreeMap<NodeAddr, u64>,
    addr: &NodeAddr,
    bump: u64,
    host: &str,
    user: &str,
) -> MutativeHeader {
    MutativeHeader {
        expected_mutative_message_count: counts.get(addr).copied().unwrap_or(0) + bump,
        mutation_host: host.to_string(),
        mutation_user: user.to_string(),
        mutation_timestamp: Utc::now(),
    }
}

/// Event constructors of one mutative phase.
struct PhaseEvents {
    accepted: fn(NodeAddr) -> Event,
    failed: fn(NodeAddr, String) -> Event,
    other_client: fn(NodeAddr, String, String) -> Event,
    unacceptable: Option<fn(NodeAddr, String) -> Event>,
}

fn prepare_events() -> PhaseEvents {
    PhaseEvents {
        accepted: |endpoint| Event::Prepared { endpoint },
        failed: |endpoint, reason| Event::PrepareFail { endpoint, reason },
        other_client: |endpoint, last_mutation_host, last_mutation_user| {
            Event::PrepareOtherClient {
                endpoint,
                last_mutation_host,
                last_mutation_user,
            }
        },
        unacceptable: Some(|endpoint, reason| Event::PrepareChangeUnacceptable {
            endpoint,
            reason,
        }),
    }
}

fn takeover_events() -> PhaseEvents {
    PhaseEvents {
        accepted: |endpoint| Event::TakenOver { endpoint },
        failed: |endpoint, reason| Event::TakeoverFail { endpoint, reason },
        other_client: |endpoint, last_mutation_host, last_mutation_user| {
            Event::TakeoverOtherClient {
                endpoint,
                last_mutation_host,
                last_mutation_user,
            }
        },
        unacceptable: None,
    }
}

fn commit_events() -> PhaseEvents {
    PhaseEvents {
        accepted: |endpoint| Event::Committed { endpoint },
        failed: |endpoint, reason| Event::CommitFail { endpoint, reason },
        other_client: |endpoint, last_mutation_host, last_mutation_user| {
            Event::CommitOtherClient {
                endpoint,
                last_mutation_host,
                last_mutation_user,
            }
        },
        unacceptable: None,
    }
}

fn rollback_events() -> PhaseEvents {
    PhaseEvents {
        accepted: |endpoint| Event::RolledBack { endpoint },
        failed: |endpoint, reason| Event::RollbackFail { endpoint, reason },
        other_client: |endpoint, last_mutation_host, last_mutation_user| {
            Event::RollbackOtherClient {
                endpoint,
                last_mutation_host,
                last_mutation_user,
            }
        },
        unacceptable: None,
    }
}

fn collect_phase(
    sink: &mut dyn EventSink,
    results: Vec<(NodeAddr, Result<AcceptRejectResponse, Error>)>,
    events: &PhaseEvents,
) -> PhaseOutcome {
    let mut outcome = PhaseOutcome::new();
    for (addr, result) in results {
        match result {
            Ok(AcceptRejectResponse::Accept) => {
                sink.send((events.accepted)(addr.clone()));
                outcome.record_accepted(addr);
            }
            Ok(AcceptRejectResponse::Reject {
                reason,
                message,
                last_mutation_host,
                last_mutation_user,
            }) => {
                let event = match reason {
                    RejectionReason::Dead => (events.other_client)(
                        addr.clone(),
                        last_mutation_host.unwrap_or_default(),
                        last_mutation_user.unwrap_or_default(),
                    ),
                    RejectionReason::Unacceptable => match events.unacceptable {
                        Some(make) => make(addr.clone(), message),
                        None => (events.failed)(addr.clone(), message),
                    },
                    RejectionReason::Bad => (events.failed)(addr.clone(), message),
                };
                sink.send(event);
                outcome.record_failed(addr);
            }
            Err(e) => {
                sink.send((events.failed)(addr.clone(), e.to_string()));
                outcome.record_failed(addr);
            }
        }
    }
    outcome
}
