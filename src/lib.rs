//! Congestion control for multipath transport connections
//!
//! This crate contains a fully deterministic implementation of the CMT/RPv2
//! (Concurrent Multipath Transfer with Resource Pooling, version 2) congestion
//! control law. It contains no networking code, performs no I/O and keeps no
//! timers; it is driven synchronously by a transport stack that delivers ACK
//! and loss events for individual subflows and reads back the resulting
//! window decisions.
//!
//! The transport picks a [`ControllerFactory`] once per connection, depending
//! on whether multipath was negotiated, and builds one [`Controller`] per
//! connection from it:
//!
//! - [`RpV2`] couples the subflows of a connection: every window growth
//!   decision is weighted by the subflow's share of the pooled bandwidth
//!   across all paths, so low-RTT paths earn window faster while the
//!   aggregate behaves like a single well-behaved flow.
//! - [`NewReno`] applies the conventional single-path rules to each path
//!   independently, for connections without multipath.
//!
//! ```
//! use std::sync::Arc;
//! use cmt_rpv2::{Controller, ControllerFactory, RpV2Config};
//!
//! let factory = Arc::new(RpV2Config::default());
//! let mut cc = factory.build();
//!
//! let a = cc.add_subflow();
//! let b = cc.add_subflow();
//! cc.subflow_mut(a).unwrap().set_srtt_us(50_000);
//! cc.subflow_mut(b).unwrap().set_srtt_us(100_000);
//! cc.update_connection_rtt(60_000);
//!
//! // An ACK for one segment on subflow `a`
//! cc.on_ack(a, 1, true).unwrap();
//! assert!(cc.subflow(a).unwrap().cwnd() >= 10);
//! ```

#![warn(missing_docs)]

use std::any::Any;
use std::fmt;

use thiserror::Error;

mod new_reno;
mod rpv2;
mod subflow;

pub use new_reno::{NewReno, NewRenoConfig};
pub use rpv2::{RpV2, RpV2Config};
pub use subflow::Subflow;

/// Identifies one path of a multipath connection
///
/// Allocated by [`Controller::add_subflow`] and stable for the lifetime of the
/// path on that controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubflowId(pub u64);

impl fmt::Display for SubflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Transport events relevant to congestion window management
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CwndEvent {
    /// A retransmission timeout fired on the path
    Loss,
    /// The path resumed transmitting after an idle period
    TxStart,
}

/// Sender congestion state as tracked by the transport's recovery machinery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaState {
    /// Normal operation, no outstanding suspicion of loss
    Open,
    /// Reordering observed, not yet treated as loss
    Disorder,
    /// Fast-retransmit loss recovery in progress
    Recovery,
    /// Retransmission-timeout recovery in progress
    Loss,
}

/// Common interface for the congestion controllers of a connection
///
/// One controller instance owns the congestion state of all subflows of a
/// single connection, including any state shared between them. All methods
/// take `&mut self`; the exclusive borrow is what serializes interleaved
/// updates from different subflows of the connection.
pub trait Controller: Send + Sync {
    /// Register a new path with the controller
    ///
    /// The subflow starts with the configured initial window, an unlimited
    /// slow-start threshold and an unmeasured RTT. An unmeasured RTT keeps the
    /// path out of bandwidth aggregation and blocks its growth until the
    /// transport reports a sample via [`Subflow::set_srtt_us`].
    fn add_subflow(&mut self) -> SubflowId;

    /// Drop a path from the controller
    fn remove_subflow(&mut self, id: SubflowId) -> Result<(), UnknownSubflow>;

    /// Read-only view of a subflow's congestion state
    fn subflow(&self, id: SubflowId) -> Option<&Subflow>;

    /// Mutable handle used by the transport to feed per-path inputs
    /// (RTT samples, segment size, SACK counts, window clamp)
    fn subflow_mut(&mut self, id: SubflowId) -> Option<&mut Subflow>;

    /// Process an ACK that newly acknowledged `acked` segments on `id`
    ///
    /// Dispatches to slow start while `cwnd <= ssthresh` and to congestion
    /// avoidance above it. `cwnd_limited` reports whether the connection was
    /// actually window-limited when the ACK arrived; congestion avoidance
    /// never grows an under-utilized path.
    fn on_ack(&mut self, id: SubflowId, acked: u32, cwnd_limited: bool)
        -> Result<(), UnknownSubflow>;

    /// Compute the slow-start threshold for `id` on entry into loss recovery
    ///
    /// Returns the new threshold; the caller is responsible for assigning it
    /// via [`Subflow::set_ssthresh`]. Implementations may snap the window down
    /// as a side effect when duplicate ACKs indicate a fast retransmit.
    fn ssthresh(&mut self, id: SubflowId) -> Result<u32, UnknownSubflow>;

    /// Deliver a window-relevant transport event for `id`
    fn cwnd_event(&mut self, id: SubflowId, event: CwndEvent) -> Result<(), UnknownSubflow>;

    /// Observe a congestion-state transition for `id`
    fn set_state(&mut self, id: SubflowId, state: CaState) -> Result<(), UnknownSubflow>;

    /// Report a smoothed RTT sample for the connection as a whole
    ///
    /// Only meaningful for controllers that couple subflows; the default
    /// implementation ignores it.
    #[allow(unused_variables)]
    fn update_connection_rtt(&mut self, srtt_us: u32) {}

    /// Initial congestion window for new subflows, in segments
    fn initial_window(&self) -> u32;

    /// Retrieve per-subflow metrics for instrumentation
    fn metrics(&self, id: SubflowId) -> Option<ControllerMetrics> {
        let sub = self.subflow(id)?;
        Some(ControllerMetrics {
            congestion_window: sub.cwnd(),
            ssthresh: (sub.ssthresh() != u32::MAX).then(|| sub.ssthresh()),
        })
    }

    /// Duplicate the controller's state
    fn clone_box(&self) -> Box<dyn Controller>;

    /// Returns Self for use in down-casting to extract implementation details
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Common congestion controller metrics for one subflow
#[derive(Debug, Default, Clone, Copy)]
#[non_exhaustive]
pub struct ControllerMetrics {
    /// Congestion window (segments)
    pub congestion_window: u32,
    /// Slow start threshold (segments), if one has been established
    pub ssthresh: Option<u32>,
}

/// Constructs controllers on demand
///
/// Implemented for `Arc`-wrapped configurations so a single tuned
/// configuration can be shared by every connection of an endpoint while each
/// connection gets its own controller state.
pub trait ControllerFactory {
    /// Construct a fresh `Controller`
    fn build(&self) -> Box<dyn Controller>;
}

/// Errors in the configuration of a congestion controller
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Value exceeds supported bounds
    #[error("value exceeds supported bounds")]
    OutOfBounds,
}

/// The operation referenced a subflow not present on this connection
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("unknown subflow")]
pub struct UnknownSubflow(pub(crate) ());
