//! Per-segment ownership lifecycle.
//!
//! ```text
//! NotOwned -> Blocked -> KeyTransfer -> ValueTransfer -> Owned
//!     \__________________________________________________/^
//!                 (first topology, no state transfer)
//! ```
//!
//! Every state can drop back to `NotOwned` when a newer topology takes the
//! segment away. Each transition that belongs to a rebalance carries the id
//! of the topology it was started for; transitions for a superseded topology
//! are reported as [`Transition::Stale`] and leave the segment untouched.

use crate::error::{Result, ScatterError};
use crate::types::{SegmentId, TopologyId};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentState {
    NotOwned,
    Blocked,
    KeyTransfer,
    ValueTransfer,
    Owned,
}

impl SegmentState {
    pub fn single_char(self) -> char {
        match self {
            Self::NotOwned => 'N',
            Self::Blocked => 'B',
            Self::KeyTransfer => 'K',
            Self::ValueTransfer => 'V',
            Self::Owned => 'O',
        }
    }

    pub fn is_transferring(self) -> bool {
        matches!(self, Self::KeyTransfer | Self::ValueTransfer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied {
        from: SegmentState,
        to: SegmentState,
    },
    Stale {
        expected: TopologyId,
        current: TopologyId,
    },
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct SegmentSlot {
    state: SegmentState,
    topology_id: TopologyId,
}

pub struct SegmentStateMachine {
    slots: Box<[watch::Sender<SegmentSlot>]>,
}

impl SegmentStateMachine {
    pub fn new(num_segments: u16) -> Self {
        let slots = (0..num_segments)
            .map(|_| {
                let (sender, _) = watch::channel(SegmentSlot {
                    state: SegmentState::NotOwned,
                    topology_id: 0,
                });
                sender
            })
            .collect();
        Self { slots }
    }

    pub fn num_segments(&self) -> u16 {
        self.slots.len() as u16
    }

    fn slot(&self, segment: SegmentId) -> &watch::Sender<SegmentSlot> {
        self.slots.get(usize::from(segment)).unwrap_or_else(|| {
            panic!(
                "segment {} out of range (num_segments={})",
                segment,
                self.slots.len()
            )
        })
    }

    pub fn state(&self, segment: SegmentId) -> SegmentState {
        self.slot(segment).borrow().state
    }

    /// Topology of the last transition applied to `segment`.
    pub fn topology_of(&self, segment: SegmentId) -> TopologyId {
        self.slot(segment).borrow().topology_id
    }

    pub fn snapshot(&self) -> Vec<SegmentState> {
        self.slots.iter().map(|slot| slot.borrow().state).collect()
    }

    fn transition(
        &self,
        segment: SegmentId,
        topology_id: TopologyId,
        check_topology: bool,
        allowed_from: &[SegmentState],
        to: SegmentState,
    ) -> Result<Transition> {
        let mut outcome = None;
        self.slot(segment).send_if_modified(|slot| {
            if check_topology && slot.topology_id != topology_id {
                outcome = Some(Ok(Transition::Stale {
                    expected: topology_id,
                    current: slot.topology_id,
                }));
                return false;
            }

            if !allowed_from.contains(&slot.state) {
                outcome = Some(Err(ScatterError::IllegalTransition {
                    segment,
                    from: slot.state,
                    to,
                }));
                return false;
            }

            let from = slot.state;
            slot.state = to;
            slot.topology_id = topology_id;
            outcome = Some(Ok(Transition::Applied { from, to }));
            true
        });

        let outcome = outcome
            .unwrap_or_else(|| Err(ScatterError::Internal("segment transition not evaluated".into())));

        match &outcome {
            Ok(Transition::Applied { from, to }) => {
                tracing::trace!(
                    "Segment {} transition {:?} -> {:?} (topology {})",
                    segment,
                    from,
                    to,
                    topology_id
                );
            }
            Ok(Transition::Stale { expected, current }) => {
                tracing::debug!(
                    "Discarding stale transition of segment {} to {:?}: message topology {} but segment is at {}",
                    segment,
                    to,
                    expected,
                    current
                );
            }
            Err(_) => {}
        }

        outcome
    }

    /// This node became owner but the previous owner has not confirmed yet.
    pub fn block(&self, segment: SegmentId, topology_id: TopologyId) -> Result<Transition> {
        self.transition(
            segment,
            topology_id,
            false,
            &[SegmentState::NotOwned],
            SegmentState::Blocked,
        )
    }

    /// Ownership without state transfer (first topology or fetch disabled).
    pub fn set_owned(&self, segment: SegmentId, topology_id: TopologyId) -> Result<Transition> {
        self.transition(
            segment,
            topology_id,
            false,
            &[SegmentState::NotOwned],
            SegmentState::Owned,
        )
    }

    pub fn start_key_transfer(
        &self,
        segment: SegmentId,
        topology_id: TopologyId,
    ) -> Result<Transition> {
        self.transition(
            segment,
            topology_id,
            true,
            &[SegmentState::Blocked],
            SegmentState::KeyTransfer,
        )
    }

    pub fn finish_key_transfer(
        &self,
        segment: SegmentId,
        topology_id: TopologyId,
        expect_values: bool,
    ) -> Result<Transition> {
        let to = if expect_values {
            SegmentState::ValueTransfer
        } else {
            SegmentState::Owned
        };
        self.transition(
            segment,
            topology_id,
            true,
            &[SegmentState::KeyTransfer],
            to,
        )
    }

    pub fn finish_value_transfer(
        &self,
        segment: SegmentId,
        topology_id: TopologyId,
    ) -> Result<Transition> {
        self.transition(
            segment,
            topology_id,
            true,
            &[SegmentState::ValueTransfer],
            SegmentState::Owned,
        )
    }

    /// Unconditionally drop ownership. Waiters resolve with
    /// [`ScatterError::SegmentNoLongerOwned`].
    pub fn unregister(&self, segment: SegmentId, topology_id: TopologyId) -> SegmentState {
        let mut previous = SegmentState::NotOwned;
        self.slot(segment).send_modify(|slot| {
            previous = slot.state;
            slot.state = SegmentState::NotOwned;
            slot.topology_id = topology_id;
        });
        previous
    }

    /// Wait until the segment leaves `Blocked`.
    pub async fn wait_unblocked(&self, segment: SegmentId) -> Result<SegmentState> {
        self.wait_until(segment, |state| state != SegmentState::Blocked)
            .await
    }

    /// Wait until the segment is fully owned.
    pub async fn wait_owned(&self, segment: SegmentId) -> Result<SegmentState> {
        self.wait_until(segment, |state| state == SegmentState::Owned)
            .await
    }

    async fn wait_until(
        &self,
        segment: SegmentId,
        ready: impl Fn(SegmentState) -> bool,
    ) -> Result<SegmentState> {
        let mut receiver = self.slot(segment).subscribe();
        let state = receiver
            .wait_for(|slot| slot.state == SegmentState::NotOwned || ready(slot.state))
            .await
            .map_err(|_| ScatterError::Stopping)?
            .state;

        if state == SegmentState::NotOwned {
            return Err(ScatterError::SegmentNoLongerOwned(segment));
        }

        Ok(state)
    }

    /// Sixteen segments per line, one character per state.
    pub fn table(&self) -> String {
        let states = self.snapshot();
        let mut out = String::new();
        for (row, chunk) in states.chunks(16).enumerate() {
            out.push('\n');
            for (column, state) in chunk.iter().enumerate() {
                out.push_str(&format!("{:4}={} ", row * 16 + column, state.single_char()));
            }
        }
        out
    }
}
