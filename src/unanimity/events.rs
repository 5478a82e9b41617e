//! The crate `events` carries the protocol driver's progress as one tagged
//! event stream.
//!
//! Every per-node and per-phase callback of a run becomes an [`Event`]
//! delivered to an [`EventSink`]. Sinks compose: [`MuxSink`] fans events out,
//! [`LoggingSink`] renders them for operators, [`Recorder`] collects them for
//! inspection.

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

use log::{error, info, warn};

use crate::types::{ChangeId, ChangeRequestState, Consistency, NodeAddr};

/// One step of a protocol run.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    StartDiscovery {
        endpoints: Vec<NodeAddr>,
    },
    Discovered {
        endpoint: NodeAddr,
    },
    DiscoverFail {
        endpoint: NodeAddr,
        reason: String,
    },
    DiscoverAlreadyPrepared {
        endpoint: NodeAddr,
        change_id: ChangeId,
        creation_host: String,
        creation_user: String,
    },
    DiscoverConfigInconsistent {
        change_id: ChangeId,
        committed: Vec<NodeAddr>,
        rolled_back: Vec<NodeAddr>,
    },
    DiscoverConfigPartitioned {
        partitions: Vec<Vec<NodeAddr>>,
    },
    EndDiscovery,
    StartSecondDiscovery,
    DiscoverRepeated {
        endpoint: NodeAddr,
    },
    DiscoverOtherClient {
        endpoint: NodeAddr,
        last_mutation_host: String,
        last_mutation_user: String,
    },
    EndSecondDiscovery,
    StartPrepare {
        change_id: ChangeId,
    },
    Prepared {
        endpoint: NodeAddr,
    },
    PrepareFail {
        endpoint: NodeAddr,
        reason: String,
    },
    PrepareOtherClient {
        endpoint: NodeAddr,
        last_mutation_host: String,
        last_mutation_user: String,
    },
    PrepareChangeUnacceptable {
        endpoint: NodeAddr,
        reason: String,
    },
    EndPrepare,
    StartTakeover,
    TakenOver {
        endpoint: NodeAddr,
    },
    TakeoverOtherClient {
        endpoint: NodeAddr,
        last_mutation_host: String,
        last_mutation_user: String,
    },
    TakeoverFail {
        endpoint: NodeAddr,
        reason: String,
    },
    EndTakeover,
    StartCommit,
    Committed {
        endpoint: NodeAddr,
    },
    CommitFail {
        endpoint: NodeAddr,
        reason: String,
    },
    CommitOtherClient {
        endpoint: NodeAddr,
        last_mutation_host: String,
        last_mutation_user: String,
    },
    EndCommit,
    StartRollback,
    RolledBack {
        endpoint: NodeAddr,
    },
    RollbackFail {
        endpoint: NodeAddr,
        reason: String,
    },
    RollbackOtherClient {
        endpoint: NodeAddr,
        last_mutation_host: String,
        last_mutation_user: String,
    },
    EndRollback,
    CannotDecideOverCommitOrRollback,
    Done {
        consistency: Consistency,
    },
}

/// Consumer of a run's event stream.
pub trait EventSink {
    fn send(&mut self, event: Event);
}

/// Renders every event through the `log` crate: info for progress, warn for
/// per-node failures, error for findings that require operator intervention.
#[derive(Debug, Default)]
pub struct LoggingSink {
    resolved: Option<ChangeRequestState>,
}

impl LoggingSink {
    pub fn new() -> LoggingSink {
        LoggingSink::default()
    }
}

impl EventSink for LoggingSink {
    fn send(&mut self, event: Event) {
        match event {
            Event::StartDiscovery { endpoints } => {
                let names: Vec<String> = endpoints.iter().map(|e| e.to_string()).collect();
                info!("gathering state from nodes: {}", names.join(", "));
            }
            Event::Discovered { endpoint } | Event::DiscoverRepeated { endpoint } => {
                info!("received node state from {}", endpoint);
            }
            Event::DiscoverFail { endpoint, reason } => {
                warn!("discover failed on node {}: {}", endpoint, reason);
            }
            Event::DiscoverAlreadyPrepared {
                endpoint,
                change_id,
                creation_host,
                creation_user,
            } => {
                warn!(
                    "another change {} is already underway on {}, started by {} on {}",
                    change_id, endpoint, creation_user, creation_host
                );
            }
            Event::DiscoverConfigInconsistent {
                change_id,
                committed,
                rolled_back,
            } => {
                error!(
                    "inconsistent cluster: change {} committed on {:?}, rolled back on {:?}",
                    change_id, committed, rolled_back
                );
            }
            Event::DiscoverConfigPartitioned { partitions } => {
                error!("partitioned cluster: diverged subsets {:?}", partitions);
            }
            Event::EndDiscovery => info!("finished first round of gathering state"),
            Event::StartSecondDiscovery => info!("starting second round of gathering state"),
            Event::DiscoverOtherClient {
                endpoint,
                last_mutation_host,
                last_mutation_user,
            } => {
                warn!(
                    "another client running on {} by {} changed the state on {}",
                    last_mutation_host, last_mutation_user, endpoint
                );
            }
            Event::EndSecondDiscovery => info!("finished second round of gathering state"),
            Event::StartPrepare { change_id } => {
                info!("no node is mid-change, starting a new change {}", change_id);
            }
            Event::Prepared { endpoint } => {
                info!("node {} is prepared to make the change", endpoint);
            }
            Event::PrepareFail { endpoint, reason } => {
                warn!("prepare failed on node {}: {}", endpoint, reason);
            }
            Event::PrepareOtherClient {
                endpoint,
                last_mutation_host,
                last_mutation_user,
            } => {
                warn!(
                    "another client running on {} by {} changed the state on {}",
                    last_mutation_host, last_mutation_user, endpoint
                );
            }
            Event::PrepareChangeUnacceptable { endpoint, reason } => {
                warn!("node {} rejected the change: {}", endpoint, reason);
            }
            Event::EndPrepare => {
                self.resolved = Some(ChangeRequestState::Prepared);
                info!("finished asking nodes to prepare the change");
            }
            Event::StartTakeover => info!("taking over the in-flight change"),
            Event::TakenOver { endpoint } => info!("taken over node {}", endpoint),
            Event::TakeoverOtherClient {
                endpoint,
                last_mutation_host,
                last_mutation_user,
            } => {
                warn!(
                    "another client running on {} by {} changed the state on {}",
                    last_mutation_host, last_mutation_user, endpoint
                );
            }
            Event::TakeoverFail { endpoint, reason } => {
                warn!("takeover failed on node {}: {}", endpoint, reason);
            }
            Event::EndTakeover => info!("finished taking over"),
            Event::StartCommit => info!("committing the change"),
            Event::Committed { endpoint } => {
                info!("node {} has committed the change", endpoint);
            }
            Event::CommitFail { endpoint, reason } => {
                warn!("commit failed on node {}: {}", endpoint, reason);
            }
            Event::CommitOtherClient {
                endpoint,
                last_mutation_host,
                last_mutation_user,
            } => {
                warn!(
                    "another client running on {} by {} changed the state on {}",
                    last_mutation_host, last_mutation_user, endpoint
                );
            }
            Event::EndCommit => {
                self.resolved = Some(ChangeRequestState::Committed);
                info!("finished asking nodes to commit the change");
            }
            Event::StartRollback => info!("rolling back the change"),
            Event::RolledBack { endpoint } => {
                info!("node {} has rolled back the change", endpoint);
            }
            Event::RollbackFail { endpoint, reason } => {
                warn!("rollback failed on node {}: {}", endpoint, reason);
            }
            Event::RollbackOtherClient {
                endpoint,
                last_mutation_host,
                last_mutation_user,
            } => {
                warn!(
                    "another client running on {} by {} changed the state on {}",
                    last_mutation_host, last_mutation_user, endpoint
                );
            }
            Event::EndRollback => {
                self.resolved = Some(ChangeRequestState::RolledBack);
                info!("finished asking nodes to roll back the change");
            }
            Event::CannotDecideOverCommitOrRollback => {
                error!("cannot decide between commit and rollback, manual repair is required");
            }
            Event::Done { consistency } => match consistency {
                Consistency::Consistent => match self.resolved {
                    Some(state) => info!("the run is complete, change state: {}", state),
                    None => info!("the run is complete, nothing needed changing"),
                },
                Consistency::MayNeedRecovery => {
                    warn!("the run left nodes unresolved, a recovery run is required");
                }
                Consistency::UnknownButNoChange => {
                    info!("could not determine cluster consistency, no mutation was performed");
                }
                Consistency::UnrecoverablyInconsistent => {
                    error!("the cluster is inconsistent and cannot be trivially recovered");
                }
                Consistency::UnrecoverablyPartitioned => {
                    error!("the cluster is partitioned and cannot be trivially recovered");
                }
            },
        }
    }
}

/// Fans one event stream out to several sinks, in order.
#[derive(Default)]
pub struct MuxSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl MuxSink {
    pub fn new(sinks: Vec<Box<dyn EventSink>>) -> MuxSink {
        MuxSink { sinks }
    }

    pub fn push(&mut self, sink: Box<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

impl EventSink for MuxSink {
    fn send(&mut self, event: Event) {
        for sink in &mut self.sinks {
            sink.send(event.clone());
        }
    }
}

/// Collects events in arrival order.
#[derive(Debug, Default)]
pub struct Recorder {
    events: Vec<Event>,
}

impl Recorder {
    pub fn new() -> Recorder {
        Recorder::default()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn contains(&self, event: &Event) -> bool {
        self.events.contains(event)
    }
}

impl EventSink for Recorder {
    fn send(&mut self, event: Event) {
        self.events.push(event);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    struct Tap(Rc<RefCell<Vec<Event>>>);

    impl EventSink for Tap {
        fn send(&mut self, event: Event) {
            self.0.borrow_mut().push(event);
        }
    }

    fn endpoint() -> NodeAddr {
        NodeAddr::new("node-a", 9410)
    }

    #[test]
    fn recorder_keeps_arrival_order() {
        let mut recorder = Recorder::new();
        recorder.send(Event::StartCommit);
        recorder.send(Event::Committed {
            endpoint: endpoint(),
        });
        recorder.send(Event::EndCommit);
        assert_eq!(
            recorder.events(),
            &[
                Event::StartCommit,
                Event::Committed {
                    endpoint: endpoint()
                },
                Event::EndCommit,
            ]
        );
        assert!(recorder.contains(&Event::StartCommit));
        assert!(!recorder.contains(&Event::StartRollback));
    }

    #[test]
    fn mux_delivers_to_every_sink_in_order() {
        let first = Rc::new(RefCell::new(Vec::new()));
        let second = Rc::new(RefCell::new(Vec::new()));
        let mut mux = MuxSink::new(vec![
            Box::new(Tap(Rc::clone(&first))),
            Box::new(Tap(Rc::clone(&second))),
        ]);

        mux.send(Event::StartRollback);
        mux.send(Event::EndRollback);

        assert_eq!(&*first.borrow(), &[Event::StartRollback, Event::EndRollback]);
        assert_eq!(&*second.borrow(), &[Event::StartRollback, Event::EndRollback]);
    }

    #[test]
    fn logging_sink_tracks_the_resolved_state() {
        let mut sink = LoggingSink::new();
        assert!(sink.resolved.is_none());
        sink.send(Event::EndPrepare);
        assert_eq!(sink.resolved, Some(ChangeRequestState::Prepared));
        sink.send(Event::EndCommit);
        assert_eq!(sink.resolved, Some(ChangeRequestState::Committed));
        sink.send(Event::Done {
            consistency: Consistency::Consistent,
        });
        assert_eq!(sink.resolved, Some(ChangeRequestState::Committed));
    }
}
