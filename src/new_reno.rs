use std::any::Any;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::subflow::Subflow;
use crate::{
    CaState, ConfigError, Controller, ControllerFactory, CwndEvent, SubflowId, UnknownSubflow,
};

/// Classic Reno slow-start threshold: halve the window, floor at two segments
pub(crate) fn reno_ssthresh(cwnd: u32) -> u32 {
    (cwnd / 2).max(2)
}

/// Classic slow start: grow by the acked count, clamped to one past ssthresh
///
/// Returns the acked segments left over once the threshold was reached, for
/// the caller to feed into additive increase.
pub(crate) fn reno_slow_start(sub: &mut Subflow, acked: u32) -> u32 {
    let cwnd = sub
        .cwnd
        .saturating_add(acked)
        .min(sub.ssthresh.saturating_add(1))
        .min(sub.clamp);
    let consumed = cwnd - sub.cwnd;
    sub.cwnd = cwnd;
    acked - consumed
}

/// Additive increase: one segment of growth per `w` acked segments
pub(crate) fn reno_cong_avoid_ai(sub: &mut Subflow, w: u32, acked: u32) {
    // A window's worth of ACKs may already have accumulated before this call
    if sub.cwnd_cnt >= w {
        sub.cwnd_cnt = 0;
        sub.cwnd = sub.cwnd.saturating_add(1);
    }
    sub.cwnd_cnt = sub.cwnd_cnt.saturating_add(acked);
    if sub.cwnd_cnt >= w {
        let delta = sub.cwnd_cnt / w;
        sub.cwnd_cnt -= delta * w;
        sub.cwnd = sub.cwnd.saturating_add(delta);
    }
    sub.cwnd = sub.cwnd.min(sub.clamp);
}

/// The conventional single-path growth rule: slow start below ssthresh,
/// additive increase above it, gated on the connection being window-limited
pub(crate) fn reno_cong_avoid(sub: &mut Subflow, acked: u32, cwnd_limited: bool) {
    if !cwnd_limited {
        return;
    }
    let mut acked = acked;
    if sub.cwnd <= sub.ssthresh {
        acked = reno_slow_start(sub, acked);
        if acked == 0 {
            return;
        }
    }
    reno_cong_avoid_ai(sub, sub.cwnd, acked);
}

/// The conventional single-path congestion controller
///
/// Runs the classic Reno rules over each path independently, with no coupling
/// between them. Selected for connections where multipath was not negotiated;
/// [`RpV2`](crate::RpV2) also defers to these rules while a connection has
/// fewer than two paths.
#[derive(Debug, Clone)]
pub struct NewReno {
    config: Arc<NewRenoConfig>,
    subflows: FxHashMap<SubflowId, Subflow>,
    next_id: u64,
}

impl NewReno {
    /// Construct a controller using the given `config`
    pub fn new(config: Arc<NewRenoConfig>) -> Self {
        Self {
            config,
            subflows: FxHashMap::default(),
            next_id: 0,
        }
    }
}

impl Controller for NewReno {
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
        let sub = self.subflows.get_mut(&id).ok_or(UnknownSubflow(()))?;
        reno_cong_avoid(sub, acked, cwnd_limited);
        trace!(%id, cwnd = sub.cwnd, "ack processed");
        Ok(())
    }

    fn ssthresh(&mut self, id: SubflowId) -> Result<u32, UnknownSubflow> {
        let sub = self.subflows.get(&id).ok_or(UnknownSubflow(()))?;
        let ssthresh = reno_ssthresh(sub.cwnd);
        debug!(%id, cwnd = sub.cwnd, ssthresh, "ssthresh computed");
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

/// Configuration for the `NewReno` congestion controller
#[derive(Debug, Clone)]
pub struct NewRenoConfig {
    initial_window: u32,
    mss: u32,
    clamp: u32,
}

impl NewRenoConfig {
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

impl Default for NewRenoConfig {
    fn default() -> Self {
        Self {
            initial_window: 10,
            mss: 1460,
            clamp: u32::MAX,
        }
    }
}

impl ControllerFactory for Arc<NewRenoConfig> {
    fn build(&self) -> Box<dyn Controller> {
        Box::new(NewReno::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> NewReno {
        NewReno::new(Arc::new(NewRenoConfig::default()))
    }

    #[test]
    fn ssthresh_halves_with_floor() {
        assert_eq!(reno_ssthresh(10), 5);
        assert_eq!(reno_ssthresh(3), 2);
        assert_eq!(reno_ssthresh(1), 2);
    }

    #[test]
    fn slow_start_grows_by_acked() {
        let mut cc = controller();
        let id = cc.add_subflow();
        cc.on_ack(id, 4, true).unwrap();
        assert_eq!(cc.subflow(id).unwrap().cwnd(), 14);
    }

    #[test]
    fn slow_start_stops_at_threshold() {
        let mut cc = controller();
        let id = cc.add_subflow();
        cc.subflow_mut(id).unwrap().set_ssthresh(12);

        // 10 -> clamped to ssthresh + 1, remainder feeds additive increase
        cc.on_ack(id, 8, true).unwrap();
        let sub = cc.subflow(id).unwrap();
        assert_eq!(sub.cwnd(), 13);
        assert_eq!(sub.cwnd_cnt(), 5);
    }

    #[test]
    fn additive_increase_one_per_window() {
        let mut cc = controller();
        let id = cc.add_subflow();
        cc.subflow_mut(id).unwrap().set_ssthresh(5);
        let w = cc.subflow(id).unwrap().cwnd();
        assert_eq!(w, 10);

        for _ in 0..w {
            cc.on_ack(id, 1, true).unwrap();
        }
        assert_eq!(cc.subflow(id).unwrap().cwnd(), 11);
        assert_eq!(cc.subflow(id).unwrap().cwnd_cnt(), 0);
    }

    #[test]
    fn growth_respects_clamp() {
        let mut cc = controller();
        let id = cc.add_subflow();
        cc.subflow_mut(id).unwrap().set_clamp(12);
        cc.on_ack(id, 100, true).unwrap();
        assert_eq!(cc.subflow(id).unwrap().cwnd(), 12);
    }

    #[test]
    fn idle_connection_does_not_grow() {
        let mut cc = controller();
        let id = cc.add_subflow();
        cc.on_ack(id, 4, false).unwrap();
        assert_eq!(cc.subflow(id).unwrap().cwnd(), 10);
    }

    #[test]
    fn loss_event_resets_window() {
        let mut cc = controller();
        let id = cc.add_subflow();
        cc.cwnd_event(id, CwndEvent::Loss).unwrap();
        assert_eq!(cc.subflow(id).unwrap().cwnd(), 1);

        // Other events leave the window alone
        cc.cwnd_event(id, CwndEvent::TxStart).unwrap();
        assert_eq!(cc.subflow(id).unwrap().cwnd(), 1);
    }

    #[test]
    fn unknown_subflow_is_an_error() {
        let mut cc = controller();
        let id = cc.add_subflow();
        cc.remove_subflow(id).unwrap();
        assert_eq!(cc.on_ack(id, 1, true), Err(UnknownSubflow(())));
        assert_eq!(cc.ssthresh(id), Err(UnknownSubflow(())));
        assert_eq!(cc.remove_subflow(id), Err(UnknownSubflow(())));
    }
}
