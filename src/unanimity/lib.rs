//! # unanimity
//!
//! `unanimity` applies configuration changes to a small cluster of nodes
//! with all-or-nothing semantics and without a central coordinator. A
//! change is durable on every node or on none; when a client dies partway
//! through, a later recovery run finishes or unwinds whatever it left
//! behind.
//!
//! A run works in phases:
//!
//! - discovery, twice: gather every node's state, then gather it again and
//!   compare mutative message counts to detect a concurrently active client
//! - prepare: offer the change to every node; each node validates it
//!   against its current configuration and persists it as in-flight
//! - commit, when every node accepted the prepare; rollback of the
//!   accepting nodes otherwise
//!
//! Every mutation a node accepts lands in its [`Journal`] before the node
//! answers: an append-only store of hash-chained records kept in two
//! alternating generation files, so that a crash mid-write can never
//! produce a state the node cannot distinguish from a valid one.
//!
//! The driver reports progress as [`Event`]s and folds a whole run into a
//! single [`Consistency`](types::Consistency) verdict; it never returns an
//! error.

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

extern crate chrono;
extern crate hex;
extern crate log;
extern crate serde;
extern crate serde_json;
extern crate sha2;
extern crate thiserror;
extern crate uuid;

mod error;

pub mod checker;
pub mod client;
pub mod constant;
pub mod decider;
pub mod events;
pub mod journal;
pub mod server;
pub mod state;
pub mod types;

pub use crate::error::Error;
pub use crate::checker::{check_cluster_consistency, ConsistencyFinding};
pub use crate::client::{Client, ClientOptions, NodeEndpoint, NodeHandle};
pub use crate::events::{Event, EventSink, LoggingSink, MuxSink, Recorder};
pub use crate::journal::{Journal, JournalMutation, JournalValue};
pub use crate::server::{ChangeApplicator, NodeServer, PotentialApplicationResult};
pub use crate::state::{ChangeRequest, JournalStore, MemoryStore, StateChange, StateStore};
