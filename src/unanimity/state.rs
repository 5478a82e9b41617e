//! The crate `state` defines the persistent state every node keeps for the
//! change protocol, behind a [`StateStore`] seam.
//!
//! Mutations are batched into a [`StateChange`] and applied atomically;
//! applying a batch always advances the node's mutative message count by
//! exactly one, which is what lets clients detect concurrent mutators.

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

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constant::*;
use crate::error::Error;
use crate::journal::{Journal, JournalMutation};
use crate::types::{ChangeId, ChangeRequestState, ConfigChange, NodeMode};

/// One configuration change as a node stores it, including the link to the
/// change it was prepared on top of.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub state: ChangeRequestState,
    pub version: u64,
    pub prev_change_id: Option<ChangeId>,
    pub change: ConfigChange,
    pub change_result: String,
    pub creation_host: String,
    pub creation_user: String,
    pub creation_timestamp: DateTime<Utc>,
}

/// A batch of field updates applied to a [`StateStore`] as one atomic
/// mutation. Unset fields keep their stored value.
#[derive(Debug, Clone, Default)]
pub struct StateChange {
    mode: Option<NodeMode>,
    latest_change_id: Option<ChangeId>,
    current_version: Option<u64>,
    highest_version: Option<u64>,
    last_mutation_host: Option<String>,
    last_mutation_user: Option<String>,
    last_mutation_timestamp: Option<DateTime<Utc>>,
    created: Vec<(ChangeId, ChangeRequest)>,
    updated: Vec<(ChangeId, ChangeRequestState)>,
}

impl StateChange {
    pub fn new() -> StateChange {
        StateChange::default()
    }

    pub fn set_mode(mut self, mode: NodeMode) -> StateChange {
        self.mode = Some(mode);
        self
    }

    pub fn set_latest_change_id(mut self, change_id: ChangeId) -> StateChange {
        self.latest_change_id = Some(change_id);
        self
    }

    pub fn set_current_version(mut self, version: u64) -> StateChange {
        self.current_version = Some(version);
        self
    }

    pub fn set_highest_version(mut self, version: u64) -> StateChange {
        self.highest_version = Some(version);
        self
    }

    pub fn set_last_mutation_host(mut self, host: &str) -> StateChange {
        self.last_mutation_host = Some(host.to_string());
        self
    }

    pub fn set_last_mutation_user(mut self, user: &str) -> StateChange {
        self.last_mutation_user = Some(user.to_string());
        self
    }

    pub fn set_last_mutation_timestamp(mut self, timestamp: DateTime<Utc>) -> StateChange {
        self.last_mutation_timestamp = Some(timestamp);
        self
    }

    pub fn create_change(mut self, change_id: ChangeId, request: ChangeRequest) -> StateChange {
        self.created.push((change_id, request));
        self
    }

    pub fn update_change_state(
        mut self,
        change_id: ChangeId,
        state: ChangeRequestState,
    ) -> StateChange {
        self.updated.push((change_id, state));
        self
    }
}

/// Persistence seam between the node state machine and its storage.
///
/// Getters return the stored value or that field's zero value on a store
/// that has not been initialized yet; [`NodeServer`](crate::server::NodeServer)
/// seeds initial state before serving.
pub trait StateStore {
    fn is_initialized(&self) -> bool;
    fn mode(&self) -> NodeMode;
    fn mutative_message_count(&self) -> u64;
    fn last_mutation_host(&self) -> Option<String>;
    fn last_mutation_user(&self) -> Option<String>;
    fn last_mutation_timestamp(&self) -> Option<DateTime<Utc>>;
    fn latest_change_id(&self) -> Option<ChangeId>;
    fn current_version(&self) -> u64;
    fn highest_version(&self) -> u64;
    fn change_request(&self, change_id: &ChangeId) -> Option<ChangeRequest>;
    fn apply(&mut self, change: StateChange) -> Result<(), Error>;
}

/// [`StateStore`] backed by a [`Journal`]; the production store.
#[derive(Debug)]
pub struct JournalStore {
    journal: Journal,
}

impl JournalStore {
    pub fn new(journal: Journal) -> JournalStore {
        JournalStore { journal }
    }
}

impl StateStore for JournalStore {
    fn is_initialized(&self) -> bool {
        self.journal.get_string(MODE_KEY).is_some()
    }

    fn mode(&self) -> NodeMode {
        match self.journal.get_string(MODE_KEY) {
            Some(s) => s.parse().unwrap_or(NodeMode::Accepting),
            None => NodeMode::Accepting,
        }
    }

    fn mutative_message_count(&self) -> u64 {
        self.journal.get_long(MUTATIVE_MESSAGE_COUNT_KEY).unwrap_or(0) as u64
    }

    fn last_mutation_host(&self) -> Option<String> {
        self.journal.get_string(LAST_MUTATION_HOST_KEY).map(str::to_string)
    }

    fn last_mutation_user(&self) -> Option<String> {
        self.journal.get_string(LAST_MUTATION_USER_KEY).map(str::to_string)
    }

    fn last_mutation_timestamp(&self) -> Option<DateTime<Utc>> {
        self.journal
            .get_string(LAST_MUTATION_TIMESTAMP_KEY)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    fn latest_change_id(&self) -> Option<ChangeId> {
        self.journal
            .get_string(LATEST_CHANGE_ID_KEY)
            .and_then(ChangeId::parse)
    }

    fn current_version(&self) -> u64 {
        self.journal.get_long(CURRENT_VERSION_KEY).unwrap_or(0) as u64
    }

    fn highest_version(&self) -> u64 {
        self.journal.get_long(HIGHEST_VERSION_KEY).unwrap_or(0) as u64
    }

    fn change_request(&self, change_id: &ChangeId) -> Option<ChangeRequest> {
        self.journal
            .get_object(&change_key(&change_id.to_string()))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    fn apply(&mut self, change: StateChange) -> Result<(), Error> {
        let mut batch = Vec::new();
        batch.push(JournalMutation::SetLong(
            MUTATIVE_MESSAGE_COUNT_KEY.to_string(),
            self.mutative_message_count() as i64 + 1,
        ));
        if let Some(mode) = change.mode {
            batch.push(JournalMutation::SetString(
                MODE_KEY.to_string(),
                mode.to_string(),
            ));
        }
        if let Some(change_id) = change.latest_change_id {
            batch.push(JournalMutation::SetString(
                LATEST_CHANGE_ID_KEY.to_string(),
                change_id.to_string(),
            ));
        }
        if let Some(version) = change.current_version {
            batch.push(JournalMutation::SetLong(
                CURRENT_VERSION_KEY.to_string(),
                version as i64,
            ));
        }
        if let Some(version) = change.highest_version {
            batch.push(JournalMutation::SetLong(
                HIGHEST_VERSION_KEY.to_string(),
                version as i64,
            ));
        }
        if let Some(host) = change.last_mutation_host {
            batch.push(JournalMutation::SetString(
                LAST_MUTATION_HOST_KEY.to_string(),
                host,
            ));
        }
        if let Some(user) = change.last_mutation_user {
            batch.push(JournalMutation::SetString(
                LAST_MUTATION_USER_KEY.to_string(),
                user,
            ));
        }
        if let Some(timestamp) = change.last_mutation_timestamp {
            batch.push(JournalMutation::SetString(
                LAST_MUTATION_TIMESTAMP_KEY.to_string(),
                timestamp.to_rfc3339(),
            ));
        }
        for (change_id, request) in change.created {
            batch.push(JournalMutation::SetObject(
                change_key(&change_id.to_string()),
                serde_json::to_value(&request)?,
            ));
        }
        for (change_id, state) in change.updated {
            let mut request = self.change_request(&change_id).ok_or_else(|| Error::Corrupt {
                detail: format!("no stored request for change {}", change_id),
            })?;
            request.state = state;
            batch.push(JournalMutation::SetObject(
                change_key(&change_id.to_string()),
                serde_json::to_value(&request)?,
            ));
        }
        self.journal.mutate(batch)
    }
}

/// In-memory [`StateStore`] for tests and embedders that bring their own
/// durability.
#[derive(Debug, Default)]
pub struct MemoryStore {
    mode: Option<NodeMode>,
    mutative_message_count: u64,
    last_mutation_host: Option<String>,
    last_mutation_user: Option<String>,
    last_mutation_timestamp: Option<DateTime<Utc>>,
    latest_change_id: Option<ChangeId>,
    current_version: u64,
    highest_version: u64,
    changes: BTreeMap<ChangeId, ChangeRequest>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
}

impl StateStore for MemoryStore {
    fn is_initialized(&self) -> bool {
        self.mode.is_some()
    }

    fn mode(&self) -> NodeMode {
        self.mode.unwrap_or(NodeMode::Accepting)
    }

    fn mutative_message_count(&self) -> u64 {
        self.mutative_message_count
    }

    fn last_mutation_host(&self) -> Option<String> {
        self.last_mutation_host.clone()
    }

    fn last_mutation_user(&self) -> Option<String> {
        self.last_mutation_user.clone()
    }

    fn last_mutation_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_mutation_timestamp
    }

    fn latest_change_id(&self) -> Option<ChangeId> {
        self.latest_change_id
    }

    fn current_version(&self) -> u64 {
        self.current_version
    }

    fn highest_version(&self) -> u64 {
        self.highest_version
    }

    fn change_request(&self, change_id: &ChangeId) -> Option<ChangeRequest> {
        self.changes.get(change_id).cloned()
    }

    fn apply(&mut self, change: StateChange) -> Result<(), Error> {
        for (change_id, _) in &change.updated {
            if !self.changes.contains_key(change_id) {
                return Err(Error::Corrupt {
                    detail: format!("no stored request for change {}", change_id),
                });
            }
        }
        self.mutative_message_count += 1;
        if let Some(mode) = change.mode {
            self.mode = Some(mode);
        }
        if let Some(change_id) = change.latest_change_id {
            self.latest_change_id = Some(change_id);
        }
        if let Some(version) = change.current_version {
            self.current_version = version;
        }
        if let Some(version) = change.highest_version {
            self.highest_version = version;
        }
        if let Some(host) = change.last_mutation_host {
            self.last_mutation_host = Some(host);
        }
        if let Some(user) = change.last_mutation_user {
            self.last_mutation_user = Some(user);
        }
        if let Some(timestamp) = change.last_mutation_timestamp {
            self.last_mutation_timestamp = Some(timestamp);
        }
        for (change_id, request) in change.created {
            self.changes.insert(change_id, request);
        }
        for (change_id, state) in change.updated {
            if let Some(request) = self.changes.get_mut(&change_id) {
                request.state = state;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(state: ChangeRequestState, version: u64) -> ChangeRequest {
        ChangeRequest {
            state,
            version,
            prev_change_id: None,
            change: ConfigChange::new("set", "offheap=2GB"),
            change_result: "applied".to_string(),
            creation_host: "host-a".to_string(),
            creation_user: "alice".to_string(),
            creation_timestamp: Utc::now(),
        }
    }

    fn journal_store(dir: &std::path::Path) -> JournalStore {
        JournalStore::new(Journal::open(dir).unwrap())
    }

    #[test]
    fn fresh_store_reads_zero_values() {
        let store = MemoryStore::new();
        assert!(!store.is_initialized());
        assert_eq!(store.mode(), NodeMode::Accepting);
        assert_eq!(store.mutative_message_count(), 0);
        assert_eq!(store.current_version(), 0);
        assert!(store.latest_change_id().is_none());
    }

    #[test]
    fn every_batch_advances_count_by_one() {
        let mut store = MemoryStore::new();
        store
            .apply(StateChange::new().set_mode(NodeMode::Accepting))
            .unwrap();
        assert_eq!(store.mutative_message_count(), 1);
        store
            .apply(StateChange::new().set_last_mutation_host("host-b"))
            .unwrap();
        assert_eq!(store.mutative_message_count(), 2);
    }

    #[test]
    fn create_and_update_change_request() {
        let mut store = MemoryStore::new();
        let change_id = ChangeId::new();
        store
            .apply(
                StateChange::new()
                    .set_mode(NodeMode::Prepared)
                    .set_latest_change_id(change_id)
                    .set_highest_version(1)
                    .create_change(change_id, request(ChangeRequestState::Prepared, 1)),
            )
            .unwrap();
        assert_eq!(
            store.change_request(&change_id).unwrap().state,
            ChangeRequestState::Prepared
        );

        store
            .apply(
                StateChange::new()
                    .set_mode(NodeMode::Accepting)
                    .set_current_version(1)
                    .update_change_state(change_id, ChangeRequestState::Committed),
            )
            .unwrap();
        assert_eq!(
            store.change_request(&change_id).unwrap().state,
            ChangeRequestState::Committed
        );
        assert_eq!(store.current_version(), 1);
        assert_eq!(store.mode(), NodeMode::Accepting);
    }

    #[test]
    fn updating_unknown_change_fails() {
        let mut store = MemoryStore::new();
        let result = store.apply(
            StateChange::new().update_change_state(ChangeId::new(), ChangeRequestState::Committed),
        );
        assert!(matches!(result, Err(Error::Corrupt { .. })));
    }

    #[test]
    fn journal_store_round_trips_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let change_id = ChangeId::new();
        let timestamp = Utc::now();
        {
            let mut store = journal_store(dir.path());
            assert!(!store.is_initialized());
            store
                .apply(
                    StateChange::new()
                        .set_mode(NodeMode::Prepared)
                        .set_latest_change_id(change_id)
                        .set_highest_version(3)
                        .set_last_mutation_host("host-a")
                        .set_last_mutation_user("alice")
                        .set_last_mutation_timestamp(timestamp)
                        .create_change(change_id, request(ChangeRequestState::Prepared, 3)),
                )
                .unwrap();
        }

        let store = journal_store(dir.path());
        assert!(store.is_initialized());
        assert_eq!(store.mode(), NodeMode::Prepared);
        assert_eq!(store.mutative_message_count(), 1);
        assert_eq!(store.latest_change_id(), Some(change_id));
        assert_eq!(store.highest_version(), 3);
        assert_eq!(store.last_mutation_host().as_deref(), Some("host-a"));
        assert_eq!(store.last_mutation_user().as_deref(), Some("alice"));
        assert_eq!(
            store.last_mutation_timestamp().map(|t| t.timestamp()),
            Some(timestamp.timestamp())
        );
        let stored = store.change_request(&change_id).unwrap();
        assert_eq!(stored.state, ChangeRequestState::Prepared);
        assert_eq!(stored.version, 3);
    }

    #[test]
    fn journal_store_updates_change_state() {
        let dir = tempfile::tempdir().unwrap();
        let change_id = ChangeId::new();
        let mut store = journal_store(dir.path());
        store
            .apply(
                StateChange::new()
                    .set_mode(NodeMode::Prepared)
                    .create_change(change_id, request(ChangeRequestState::Prepared, 1)),
            )
            .unwrap();
        store
            .apply(
                StateChange::new()
                    .set_mode(NodeMode::Accepting)
                    .update_change_state(change_id, ChangeRequestState::RolledBack),
            )
            .unwrap();
        assert_eq!(store.mutative_message_count(), 2);
        assert_eq!(
            store.change_request(&change_id).unwrap().state,
            ChangeRequestState::RolledBack
        );
    }
}
