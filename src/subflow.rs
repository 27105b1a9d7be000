/// Per-path congestion state for one subflow of a multipath connection
///
/// The controller owns every `Subflow` and is the only writer of `cwnd` and
/// `cwnd_cnt`. The transport feeds measurement inputs through the setters and
/// assigns the slow-start threshold it obtained from
/// [`Controller::ssthresh`](crate::Controller::ssthresh).
#[derive(Debug, Clone)]
pub struct Subflow {
    /// Congestion window in segments, never below one
    pub(crate) cwnd: u32,
    /// Slow-start threshold in segments, `u32::MAX` until first established
    pub(crate) ssthresh: u32,
    /// Smoothed RTT in microseconds, 0 while unmeasured
    pub(crate) srtt_us: u32,
    /// Maximum segment size in bytes
    pub(crate) mss: u32,
    /// Selectively acknowledged segments, the duplicate-ACK proxy
    pub(crate) sacked_out: u32,
    /// Pacing counter for linear growth in congestion avoidance
    pub(crate) cwnd_cnt: u32,
    /// Upper bound on `cwnd`
    pub(crate) clamp: u32,
    /// Whether the transport currently allows this path to send
    pub(crate) active: bool,
}

impl Subflow {
    pub(crate) fn new(initial_window: u32, mss: u32, clamp: u32) -> Self {
        Self {
            cwnd: initial_window.max(1),
            ssthresh: u32::MAX,
            srtt_us: 0,
            mss: mss.max(1),
            sacked_out: 0,
            cwnd_cnt: 0,
            clamp: clamp.max(1),
            active: true,
        }
    }

    /// Congestion window in segments
    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    /// Slow-start threshold in segments, `u32::MAX` while unlimited
    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    /// Smoothed RTT in microseconds, 0 while unmeasured
    pub fn srtt_us(&self) -> u32 {
        self.srtt_us
    }

    /// Maximum segment size in bytes
    pub fn mss(&self) -> u32 {
        self.mss
    }

    /// Selectively acknowledged segments currently outstanding
    pub fn sacked_out(&self) -> u32 {
        self.sacked_out
    }

    /// Pacing counter for linear growth
    pub fn cwnd_cnt(&self) -> u32 {
        self.cwnd_cnt
    }

    /// Upper bound on the congestion window
    pub fn clamp(&self) -> u32 {
        self.clamp
    }

    /// Whether the path participates in bandwidth aggregation
    ///
    /// Requires the transport to allow sending on the path and at least one
    /// RTT measurement. Ineligible paths contribute nothing to the pooled
    /// bandwidth and their own window never grows.
    pub fn is_eligible(&self) -> bool {
        self.active && self.srtt_us > 0
    }

    /// Record a smoothed RTT sample from the transport's estimator
    pub fn set_srtt_us(&mut self, srtt_us: u32) {
        self.srtt_us = srtt_us;
    }

    /// Update the segment size for the path
    pub fn set_mss(&mut self, mss: u32) {
        self.mss = mss.max(1);
    }

    /// Update the selective-acknowledgement count
    pub fn set_sacked_out(&mut self, sacked_out: u32) {
        self.sacked_out = sacked_out;
    }

    /// Update the congestion window clamp
    pub fn set_clamp(&mut self, clamp: u32) {
        self.clamp = clamp.max(1);
    }

    /// Mark whether the transport currently allows sending on this path
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// Assign a slow-start threshold computed by the controller
    pub fn set_ssthresh(&mut self, ssthresh: u32) {
        self.ssthresh = ssthresh.max(1);
    }

    /// Fixed-point bandwidth estimate `(cwnd << scale) / srtt`, or `None`
    /// while the path is ineligible
    ///
    /// This is a rate proxy recomputed from the live window and RTT on every
    /// decision, not a measured throughput. Computed in 128 bits and
    /// saturated so an oversized window cannot overflow the sum.
    pub(crate) fn scaled_bandwidth(&self, scale: u32) -> Option<u64> {
        if !self.is_eligible() {
            return None;
        }
        let bw = (u128::from(self.cwnd) << scale) / u128::from(self.srtt_us);
        Some(u64::try_from(bw).unwrap_or(u64::MAX))
    }
}
