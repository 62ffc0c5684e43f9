// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Model instance lifecycle.
//!
//! ```text
//! Starting -> Ready -> Busy <-> Ready -> Draining -> Stopped
//! ```
//!
//! Every state change goes through [`InstanceState::on`]; anything not in the
//! table is a [`TransitionError`], so e.g. `Stopped -> Busy` cannot happen.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// process launched, not yet accepting work.
    Starting,
    /// idle.
    Ready,
    /// a task is queued or running.
    Busy,
    /// retiring: finishes an in-flight task, accepts nothing new.
    Draining,
    /// process gone, memory released.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceEvent {
    Launched,
    Submitted,
    Resolved,
    Drain,
    Stop,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal instance transition: {event:?} while {from:?}")]
pub struct TransitionError {
    pub from: InstanceState,
    pub event: InstanceEvent,
}

impl InstanceState {
    pub fn on(self, event: InstanceEvent) -> Result<InstanceState, TransitionError> {
        use InstanceEvent as E;
        use InstanceState as S;

        let next = match (self, event) {
            (S::Starting, E::Launched) => S::Ready,
            (S::Ready, E::Submitted) => S::Busy,
            (S::Busy, E::Resolved) => S::Ready,
            (S::Draining, E::Resolved) => S::Draining,
            (S::Starting | S::Ready | S::Busy | S::Draining, E::Drain) => S::Draining,
            (S::Draining, E::Stop) => S::Stopped,
            (S::Starting | S::Ready | S::Busy | S::Draining, E::Exited) => S::Stopped,
            (from, event) => return Err(TransitionError { from, event }),
        };
        Ok(next)
    }

    pub fn is_stopped(self) -> bool {
        self == InstanceState::Stopped
    }
}
