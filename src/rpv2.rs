use std::any::Any;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::new_reno::{reno_cong_avoid, reno_ssthresh};
use crate::subflow::Subflow;
use crate::{
    CaState, ConfigError, Controller, ControllerFactory, CwndEvent, SubflowId, UnknownSubflow,
};

/// Largest supported fixed-point shift
///
/// `(cwnd << scale)` must fit a `u64` for every supported window, so with the
/// default scale of 32 windows up to 2^20 segments are exact; larger products
/// saturate rather than wrap.
const MAX_SCALE: u32 = 48;

/// Concurrent Multipath Transfer with Resource Pooling, version 2
///
/// Couples the congestion windows of all subflows of one connection: each
/// ACK-driven growth decision is scaled by the acking subflow's share of the
/// bandwidth pooled across every eligible path, so the aggregate approximates
/// a single well-behaved flow while capacity shifts towards faster paths.
/// Based on the CMT/RPv2 design in Dreibholz, "Evaluation and Optimisation of
/// Multi-Path Transport using the Stream Control Transmission Protocol"
/// (habilitation treatise, University of Duisburg-Essen, 2012).
///
/// A connection with fewer than two paths behaves exactly like
/// [`NewReno`](crate::NewReno); the pooled math only applies once a second
/// path exists.
#[derive(Debug, Clone)]
pub struct RpV2 {
    config: Arc<RpV2Config>,
    subflows: FxHashMap<SubflowId, Subflow>,
    next_id: u64,
    /// Representative RTT for the connection as a whole, in microseconds;
    /// slow-start ratios are computed against this rather than the acking
    /// subflow's own RTT
    meta_srtt_us: u32,
    /// Shared increase ratio, freshly recomputed before every growth decision
    increase: u64,
    /// Fractional window growth in bytes, shared by all subflows of the
    /// connection; drained one `mss` at a time as it converts into whole
    /// segments of window
    accum: u64,
}

impl RpV2 {
    /// Construct a controller using the given `config`
    pub fn new(config: Arc<RpV2Config>) -> Self {
        Self {
            config,
            subflows: FxHashMap::default(),
            next_id: 0,
            meta_srtt_us: 0,
            increase: 0,
            accum: 0,
        }
    }

    /// Bandwidth pooled across every eligible subflow, in fixed point
    ///
    /// Pure with respect to controller state; two calls with unchanged
    /// subflows return the same value. 0 when no subflow is eligible.
    fn aggregate_bandwidth(&self) -> u64 {
        let scale = self.config.scale;
        self.subflows
            .values()
            .filter_map(|sub| sub.scaled_bandwidth(scale))
            .fold(0, u64::saturating_add)
    }

    /// Recompute the shared increase ratio for a growth decision
    ///
    /// `factor` is the byte reward carried by the ACK, `srtt_us` the RTT the
    /// decision is relative to (the connection's in slow start, the subflow's
    /// own in congestion avoidance). An empty pool leaves the denominator at
    /// its defined fallback of 1, making the ratio proportional to the raw
    /// factor rather than failing.
    fn refresh_increase_ratio(&mut self, cwnd: u32, srtt_us: u32, factor: u64) {
        let total = self.aggregate_bandwidth();
        let denominator = (u128::from(srtt_us) * u128::from(total)) >> self.config.scale;
        let denominator = denominator.max(1);
        let increase = (u128::from(cwnd) * u128::from(factor)).div_ceil(denominator);
        self.increase = u64::try_from(increase).unwrap_or(u64::MAX);
        trace!(
            total_bandwidth = total,
            denominator,
            increase = self.increase,
            "increase ratio refreshed"
        );
    }

    /// Exponential-phase growth for the acking subflow
    ///
    /// The tentative window only bounds how many acked segments this phase
    /// consumes; the window itself grows solely through the shared
    /// accumulator, at most one segment per call. Returns the acked segments
    /// not consumed by slow start.
    fn slow_start(&mut self, id: SubflowId, acked: u32) -> Result<u32, UnknownSubflow> {
        let meta_srtt = self.meta_srtt_us;
        let Some(sub) = self.subflows.get(&id) else {
            return Err(UnknownSubflow(()));
        };
        let (cwnd, mss) = (sub.cwnd, sub.mss);
        let tentative = cwnd
            .saturating_add(acked)
            .min(sub.ssthresh.saturating_add(1));
        let residual = acked - (tentative - cwnd);

        let factor = (u64::from(acked) * u64::from(mss)).min(u64::from(mss));
        self.refresh_increase_ratio(cwnd, meta_srtt, factor);
        self.accum = self.accum.saturating_add(self.increase);

        if self.accum >= u64::from(mss) {
            self.accum -= u64::from(mss);
            let Some(sub) = self.subflows.get_mut(&id) else {
                return Err(UnknownSubflow(()));
            };
            sub.cwnd = sub.cwnd.saturating_add(1);
            trace!(%id, cwnd = sub.cwnd, accum = self.accum, "slow start growth");
        }
        Ok(residual)
    }

    /// Linear-phase growth for the acking subflow
    ///
    /// One segment of growth per window's worth of ACKs, gated on the shared
    /// accumulator holding at least one segment of earned bytes.
    fn cong_avoid(&mut self, id: SubflowId, cwnd_limited: bool) -> Result<(), UnknownSubflow> {
        if !self.subflows.contains_key(&id) {
            return Err(UnknownSubflow(()));
        }
        if !cwnd_limited {
            trace!(%id, "not cwnd-limited, growth skipped");
            return Ok(());
        }
        let Some(sub) = self.subflows.get(&id) else {
            return Err(UnknownSubflow(()));
        };
        let (cwnd, srtt, mss) = (sub.cwnd, sub.srtt_us, sub.mss);
        self.refresh_increase_ratio(cwnd, srtt, u64::from(mss));
        self.accum = self.accum.saturating_add(self.increase);

        let Some(sub) = self.subflows.get_mut(&id) else {
            return Err(UnknownSubflow(()));
        };
        sub.cwnd_cnt = sub.cwnd_cnt.saturating_add(1);
        if sub.cwnd_cnt >= sub.cwnd && self.accum >= u64::from(mss) {
            if sub.cwnd < sub.clamp {
                sub.cwnd += 1;
            }
            self.accum -= u64::from(mss);
            sub.cwnd_cnt = 0;
            trace!(%id, cwnd = sub.cwnd, accum = self.accum, "congestion avoidance growth");
        }
        Ok(())
    }

    /// Loss-response threshold: shrink this path's pooled-rate-implied window
    /// contribution by half, never less aggressively than a plain halving
    fn calc_ssthresh(&self, sub: &Subflow) -> u32 {
        let total = self.aggregate_bandwidth();
        let contribution = (u128::from(total) * u128::from(sub.srtt_us)) >> self.config.scale;
        let contribution = u64::try_from(contribution).unwrap_or(u64::MAX);
        let decrease = contribution.div_ceil(2).max(u64::from(sub.cwnd.div_ceil(2)));

        if decrease < u64::from(sub.cwnd) {
            sub.cwnd - decrease as u32
        } else {
            1
        }
    }
}

impl Controller for RpV2 {
    fn add_subflow(&mut self) -> SubflowId {
        let id = SubflowId(self.next_id);
        self.next_id += 1;
        self.subflows.insert(
            id,
            Subflow::new(
                self.config.initial_window,
                self.config.mss,
                self.config.clamp,
            ),
        );
        trace!(%id, "subflow added");
        id
    }

    fn remove_subflow(&mut self, id: SubflowId) -> Result<(), UnknownSubflow> {
        self.subflows.remove(&id).ok_or(UnknownSubflow(()))?;
        trace!(%id, "subflow removed");
        Ok(())
    }

    fn subflow(&self, id: SubflowId) -> Option<&Subflow> {
        self.subflows.get(&id)
    }

    fn subflow_mut(&mut self, id: SubflowId) -> Option<&mut Subflow> {
        self.subflows.get_mut(&id)
    }

    fn on_ack(
        &mut self,
        id: SubflowId,
        acked: u32,
        cwnd_limited: bool,
    ) -> Result<(), UnknownSubflow> {
        if self.subflows.len() < 2 {
            let sub = self.subflows.get_mut(&id).ok_or(UnknownSubflow(()))?;
            reno_cong_avoid(sub, acked, cwnd_limited);
            return Ok(());
        }
        let sub = self.subflows.get(&id).ok_or(UnknownSubflow(()))?;
        if !sub.is_eligible() {
            trace!(%id, "ineligible subflow, growth skipped");
            return Ok(());
        }
        if sub.cwnd <= sub.ssthresh {
            self.slow_start(id, acked)?;
            Ok(())
        } else {
            self.cong_avoid(id, cwnd_limited)
        }
    }

    fn ssthresh(&mut self, id: SubflowId) -> Result<u32, UnknownSubflow> {
        let multipath = self.subflows.len() >= 2;
        let sub = self.subflows.get(&id).ok_or(UnknownSubflow(()))?;
        let ssthresh = if multipath {
            self.calc_ssthresh(sub)
        } else {
            reno_ssthresh(sub.cwnd)
        };
        debug!(%id, cwnd = sub.cwnd, ssthresh, "ssthresh computed");

        // Fast retransmit: enough duplicate ACKs mean the path has lost a
        // segment and must shrink now rather than ease down
        let dup_ack_threshold = self.config.dup_ack_threshold;
        let sub = self.subflows.get_mut(&id).ok_or(UnknownSubflow(()))?;
        if sub.sacked_out >= dup_ack_threshold {
            sub.cwnd = ssthresh.max(1);
            debug!(%id, cwnd = sub.cwnd, "fast retransmit, window snapped to ssthresh");
        }
        Ok(ssthresh)
    }

    fn cwnd_event(&mut self, id: SubflowId, event: CwndEvent) -> Result<(), UnknownSubflow> {
        let sub = self.subflows.get_mut(&id).ok_or(UnknownSubflow(()))?;
        if event == CwndEvent::Loss {
            sub.cwnd = 1;
            debug!(%id, "retransmission timeout, window reset");
        }
        Ok(())
    }

    fn set_state(&mut self, id: SubflowId, state: CaState) -> Result<(), UnknownSubflow> {
        if !self.subflows.contains_key(&id) {
            return Err(UnknownSubflow(()));
        }
        trace!(%id, ?state, "congestion state change");
        Ok(())
    }

    fn update_connection_rtt(&mut self, srtt_us: u32) {
        self.meta_srtt_us = srtt_us;
    }

    fn initial_window(&self) -> u32 {
        self.config.initial_window
    }

    fn clone_box(&self) -> Box<dyn Controller> {
        Box::new(self.clone())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Configuration for the `RpV2` congestion controller
#[derive(Debug, Clone)]
pub struct RpV2Config {
    scale: u32,
    dup_ack_threshold: u32,
    initial_window: u32,
    mss: u32,
    clamp: u32,
}

impl RpV2Config {
    /// Fixed-point shift applied to bandwidth estimates
    ///
    /// Larger values reduce truncation error in the pooled-bandwidth
    /// division. At the default of 32, congestion windows up to 2^20 segments
    /// are computed exactly. Accepted range is 1 through 48.
    pub fn scale(&mut self, value: u32) -> Result<&mut Self, ConfigError> {
        if value == 0 || value > MAX_SCALE {
            return Err(ConfigError::OutOfBounds);
        }
        self.scale = value;
        Ok(self)
    }

    /// Duplicate-ACK count that triggers the fast-retransmit window snap
    ///
    /// Must be at least 1.
    pub fn dup_ack_threshold(&mut self, value: u32) -> Result<&mut Self, ConfigError> {
        if value == 0 {
            return Err(ConfigError::OutOfBounds);
        }
        self.dup_ack_threshold = value;
        Ok(self)
    }

    /// Initial congestion window for new subflows, in segments
    pub fn initial_window(&mut self, value: u32) -> &mut Self {
        self.initial_window = value.max(1);
        self
    }

    /// Default maximum segment size for new subflows, in bytes
    pub fn mss(&mut self, value: u32) -> Result<&mut Self, ConfigError> {
        if value == 0 {
            return Err(ConfigError::OutOfBounds);
        }
        self.mss = value;
        Ok(self)
    }

    /// Default congestion window clamp for new subflows, in segments
    pub fn clamp(&mut self, value: u32) -> &mut Self {
        self.clamp = value.max(1);
        self
    }
}

impl Default for RpV2Config {
    fn default() -> Self {
        Self {
            scale: 32,
            dup_ack_threshold: 3,
            initial_window: 10,
            mss: 1460,
            clamp: u32::MAX,
        }
    }
}

impl ControllerFactory for Arc<RpV2Config> {
    fn build(&self) -> Box<dyn Controller> {
        Box::new(RpV2::new(self.clone()))
    }
}
