//! The crate `server` implements the per-node state machine of the change
//! protocol: discover, prepare, commit, rollback and takeover.
//!
//! Every mutative message carries the count of mutations its sender last
//! observed; a mismatch means another client got there first and the message
//! is rejected `Dead` without touching state. Rejections are answers, not
//! errors: [`Error`](crate::error::Error) is reserved for storage failures.

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

use log::debug;

use crate::error::Error;
use crate::state::{ChangeRequest, StateChange, StateStore};
use crate::types::{
    result_hash, AcceptRejectResponse, ChangeDetails, ChangeId, ChangeRequestState, CommitMessage,
    ConfigChange, DiscoverResponse, MutativeHeader, NodeMode, PrepareMessage, RejectionReason,
    RollbackMessage, TakeoverMessage,
};

/// Node-local validation hook for prepared changes, and the side effect run
/// when one commits.
pub trait ChangeApplicator {
    /// Validates `change` against the currently committed configuration.
    /// `existing` is the committed configuration rendering, absent when
    /// nothing has been committed yet. Runs before anything is persisted.
    fn try_apply(
        &self,
        existing: Option<&str>,
        change: &ConfigChange,
    ) -> PotentialApplicationResult;

    /// Applies the side effects of a committing change. Runs before the
    /// commit is persisted, so a failure leaves the node still prepared.
    fn apply(&mut self, change: &ConfigChange) -> Result<(), Error>;
}

/// Answer of [`ChangeApplicator::try_apply`]: the new configuration
/// rendering, or why the change cannot be applied here.
#[derive(Debug, Clone, PartialEq)]
pub enum PotentialApplicationResult {
    Allowed(String),
    Rejected(String),
}

impl PotentialApplicationResult {
    pub fn allow(result: &str) -> PotentialApplicationResult {
        PotentialApplicationResult::Allowed(result.to_string())
    }

    pub fn reject(reason: &str) -> PotentialApplicationResult {
        PotentialApplicationResult::Rejected(reason.to_string())
    }
}

/// One node of the cluster: a [`StateStore`] plus the applicator that
/// validates and applies changes locally.
///
/// Callers hold `&mut` for mutative messages; across processes the journal
/// directory lock serializes access.
#[derive(Debug)]
pub struct NodeServer<S, A> {
    store: S,
    applicator: A,
}

impl<S: StateStore, A: ChangeApplicator> NodeServer<S, A> {
    /// Wraps a store, seeding initial state on first use. Reopening an
    /// initialized store changes nothing.
    pub fn new(store: S, applicator: A) -> Result<NodeServer<S, A>, Error> {
        let mut server = NodeServer { store, applicator };
        if !server.store.is_initialized() {
            server.store.apply(
                StateChange::new()
                    .set_mode(NodeMode::Accepting)
                    .set_current_version(0)
                    .set_highest_version(0),
            )?;
            debug!("seeded initial node state");
        }
        Ok(server)
    }

    pub fn discover(&self) -> DiscoverResponse {
        let latest_change = self
            .store
            .latest_change_id()
            .and_then(|id| self.store.change_request(&id).map(|r| details(id, r)));
        DiscoverResponse {
            mode: self.store.mode(),
            mutative_message_count: self.store.mutative_message_count(),
            last_mutation_host: self.store.last_mutation_host(),
            last_mutation_user: self.store.last_mutation_user(),
            last_mutation_timestamp: self.store.last_mutation_timestamp(),
            current_version: self.store.current_version(),
            highest_version: self.store.highest_version(),
            latest_change,
            latest_committed_change: self.latest_committed_change(),
        }
    }

    /// Follows the prev-change chain from the latest change down to the
    /// most recent one that actually committed.
    fn latest_committed_change(&self) -> Option<ChangeDetails> {
        let mut cursor = self.store.latest_change_id();
        while let Some(change_id) = cursor {
            let request = self.store.change_request(&change_id)?;
            if request.state == ChangeRequestState::Committed {
                return Some(details(change_id, request));
            }
            cursor = request.prev_change_id;
        }
        None
    }

    /// True while a prepared change awaits its commit or rollback.
    pub fn has_incomplete_change(&self) -> bool {
        if self.store.mode() != NodeMode::Prepared {
            return false;
        }
        match self.store.latest_change_id() {
            Some(change_id) => self
                .store
                .change_request(&change_id)
                .map(|r| r.state == ChangeRequestState::Prepared)
                .unwrap_or(false),
            None => false,
        }
    }

    pub fn prepare(&mut self, message: PrepareMessage) -> Result<AcceptRejectResponse, Error> {
        if let Some(reject) = self.check_alive(&message.header) {
            return Ok(reject);
        }
        let mode = self.store.mode();
        if mode != NodeMode::Accepting {
            return Ok(self.reject(
                RejectionReason::Bad,
                format!("expected mode: {}, was: {}", NodeMode::Accepting, mode),
            ));
        }
        let highest_version = self.store.highest_version();
        if message.version_number <= highest_version {
            return Ok(self.reject(
                RejectionReason::Bad,
                format!(
                    "wrong change version number: {} is not above {}",
                    message.version_number, highest_version
                ),
            ));
        }
        if self.store.change_request(&message.change_id).is_some() {
            return Ok(self.reject(
                RejectionReason::Bad,
                format!("change already exists: {}", message.change_id),
            ));
        }

        let existing = self.latest_committed_change().map(|d| d.change_result);
        let result = match self.applicator.try_apply(existing.as_deref(), &message.change) {
            PotentialApplicationResult::Allowed(result) => result,
            PotentialApplicationResult::Rejected(reason) => {
                debug!("change {} unacceptable here: {}", message.change_id, reason);
                return Ok(self.reject(RejectionReason::Unacceptable, reason));
            }
        };

        let request = ChangeRequest {
            state: ChangeRequestState::Prepared,
            version: message.version_number,
            prev_change_id: self.store.latest_change_id(),
            change: message.change,
            change_result: result,
            creation_host: message.header.mutation_host.clone(),
            creation_user: message.header.mutation_user.clone(),
            creation_timestamp: message.header.mutation_timestamp,
        };
        self.store.apply(
            StateChange::new()
                .set_mode(NodeMode::Prepared)
                .set_latest_change_id(message.change_id)
                .set_highest_version(message.version_number)
                .set_last_mutation_host(&message.header.mutation_host)
                .set_last_mutation_user(&message.header.mutation_user)
                .set_last_mutation_timestamp(message.header.mutation_timestamp)
                .create_change(message.change_id, request),
        )?;
        debug!(
            "prepared change {} at version {}",
            message.change_id, message.version_number
        );
        Ok(AcceptRejectResponse::accept())
    }

    pub fn commit(&mut self, message: CommitMessage) -> Result<AcceptRejectResponse, Error> {
        if let Some(reject) = self.check_alive(&message.header) {
            return Ok(reject);
        }
        let mode = self.store.mode();
        if mode != NodeMode::Prepared {
            return Ok(self.reject(
                RejectionReason::Bad,
                format!("expected mode: {}, was: {}", NodeMode::Prepared, mode),
            ));
        }
        let request = match self.store.change_request(&message.change_id) {
            Some(request) => request,
            None => {
                return Ok(self.reject(
                    RejectionReason::Bad,
                    format!("unknown change: {}", message.change_id),
                ))
            }
        };

        self.applicator.apply(&request.change)?;
        self.store.apply(
            StateChange::new()
                .set_mode(NodeMode::Accepting)
                .set_current_version(request.version)
                .set_last_mutation_host(&message.header.mutation_host)
                .set_last_mutation_user(&message.header.mutation_user)
                .set_last_mutation_timestamp(message.header.mutation_timestamp)
                .update_change_state(message.change_id, ChangeRequestState::Committed),
        )?;
        debug!(
            "committed change {} at version {}",
            message.change_id, request.version
        );
        Ok(AcceptRejectResponse::accept())
    }

    pub fn rollback(&mut self, message: RollbackMessage) -> Result<AcceptRejectResponse, Error> {
        if let Some(reject) = self.check_alive(&message.header) {
            return Ok(reject);
        }
        let mode = self.store.mode();
        if mode != NodeMode::Prepared {
            return Ok(self.reject(
                RejectionReason::Bad,
                format!("expected mode: {}, was: {}", NodeMode::Prepared, mode),
            ));
        }
        if self.store.change_request(&message.change_id).is_none() {
            return Ok(self.reject(
                RejectionReason::Bad,
                format!("unknown change: {}", message.change_id),
            ));
        }

        self.store.apply(
            StateChange::new()
                .set_mode(NodeMode::Accepting)
                .set_last_mutation_host(&message.header.mutation_host)
                .set_last_mutation_user(&message.header.mutation_user)
                .set_last_mutation_timestamp(message.header.mutation_timestamp)
                .update_change_state(message.change_id, ChangeRequestState::RolledBack),
        )?;
        debug!("rolled back change {}", message.change_id);
        Ok(AcceptRejectResponse::accept())
    }

    /// Records the caller as the node's current mutator without touching
    /// mode or changes, fencing out the previous client.
    pub fn takeover(&mut self, message: TakeoverMessage) -> Result<AcceptRejectResponse, Error> {
        if let Some(reject) = self.check_alive(&message.header) {
            return Ok(reject);
        }
        self.store.apply(
            StateChange::new()
                .set_last_mutation_host(&message.header.mutation_host)
                .set_last_mutation_user(&message.header.mutation_user)
                .set_last_mutation_timestamp(message.header.mutation_timestamp),
        )?;
        debug!("taken over by {}", message.header.mutation_host);
        Ok(AcceptRejectResponse::accept())
    }

    fn check_alive(&self, header: &MutativeHeader) -> Option<AcceptRejectResponse> {
        let actual = self.store.mutative_message_count();
        if header.expected_mutative_message_count == actual {
            return None;
        }
        Some(self.reject(
            RejectionReason::Dead,
            format!(
                "expected mutative message count {} != actual mutative message count {}",
                header.expected_mutative_message_count, actual
            ),
        ))
    }

    fn reject(&self, reason: RejectionReason, message: String) -> AcceptRejectResponse {
        debug!("rejecting ({:?}): {}", reason, message);
        AcceptRejectResponse::reject(
            reason,
            &message,
            self.store.last_mutation_host(),
            self.store.last_mutation_user(),
        )
    }
}

fn details(change_id: ChangeId, request: ChangeRequest) -> ChangeDetails {
    let result_hash = result_hash(&request.change_result);
    ChangeDetails {
        change_id,
        state: request.state,
        version: request.version,
        change: request.change,
        change_result: request.change_result,
        creation_host: request.creation_host,
        creation_user: request.creation_user,
        creation_timestamp: request.creation_timestamp,
        result_hash,
    }
}
