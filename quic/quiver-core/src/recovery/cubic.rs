// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The CUBIC congestion controller (RFC 8312), the default algorithm.
//!
//! Slow start doubles the window per round until loss or HyStart's RTT-rise
//! signal; afterwards the window follows the cubic curve anchored at the
//! window reached before the last congestion event, bounded below by an
//! AIMD estimate for TCP friendliness.

use crate::{
    random,
    recovery::{
        congestion_controller::{AckEvent, CongestionControl, LossEvent},
        PERSISTENT_CONGESTION_WINDOW_PACKETS,
    },
    time::Timestamp,
};
use core::time::Duration;

/// Multiplicative decrease applied on congestion, times 10
const BETA_TIMES_TEN: u64 = 7;
/// The cubic scaling constant, times 10
const C_TIMES_TEN: u64 = 4;

/// Floor of the congestion window, in packets
const MIN_CWND_IN_MSS: u32 = 2;

/// HyStart exits slow start when the round's RTT rises by this fraction
const HYSTART_RTT_GROWTH_NUM: u32 = 9;
const HYSTART_RTT_GROWTH_DEN: u32 = 8;

/// Pacing engages only when the RTT clears this floor
const MIN_PACING_RTT: Duration = Duration::from_millis(1);

/// Integer cube root by binary search
#[inline]
fn cube_root(value: u64) -> u64 {
    if value == 0 {
        return 0;
    }
    let mut low = 0u64;
    let mut high = 1u64 << 22; // (2^22)^3 > u64::MAX
    while low + 1 < high {
        let mid = (low + high) / 2;
        match mid.checked_mul(mid).and_then(|sq| sq.checked_mul(mid)) {
            Some(cube) if cube <= value => low = mid,
            _ => high = mid,
        }
    }
    low
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    SlowStart,
    CongestionAvoidance,
}

/// The CUBIC congestion controller
#[derive(Clone, Debug)]
pub struct CubicCongestionControl {
    phase: Phase,

    mtu: u16,
    pacing_enabled: bool,
    hystart_enabled: bool,

    bytes_in_flight: u32,
    bytes_in_flight_max: u32,
    exemptions: u8,

    congestion_window: u32,
    initial_congestion_window_packets: u32,
    slow_start_threshold: u32,

    /// Window reached before the last congestion event
    window_max: u32,
    /// Fast-convergence memory of the previous `window_max`
    window_last_max: u32,
    /// Milliseconds until the cubic curve crosses `window_max` again
    k_ms: u64,
    /// TCP-friendly AIMD companion window
    aimd_window: u64,

    congestion_avoidance_start: Option<Timestamp>,
    end_of_recovery: Option<Timestamp>,
    in_recovery: bool,

    smoothed_rtt: Duration,
    last_round_min_rtt: Duration,
    current_round_min_rtt: Duration,
    round_start: Option<Timestamp>,

    app_limited: bool,
}

impl CubicCongestionControl {
    pub fn new(
        mtu: u16,
        initial_window_packets: u32,
        pacing_enabled: bool,
        hystart_enabled: bool,
    ) -> Self {
        Self {
            phase: Phase::SlowStart,
            mtu,
            pacing_enabled,
            hystart_enabled,
            bytes_in_flight: 0,
            bytes_in_flight_max: mtu as u32 * initial_window_packets / 2,
            exemptions: 0,
            congestion_window: mtu as u32 * initial_window_packets,
            initial_congestion_window_packets: initial_window_packets,
            slow_start_threshold: u32::MAX,
            window_max: 0,
            window_last_max: 0,
            k_ms: 0,
            aimd_window: 0,
            congestion_avoidance_start: None,
            end_of_recovery: None,
            in_recovery: false,
            smoothed_rtt: Duration::ZERO,
            last_round_min_rtt: Duration::MAX,
            current_round_min_rtt: Duration::MAX,
            round_start: None,
            app_limited: false,
        }
    }

    #[inline]
    fn min_cwnd(&self) -> u32 {
        self.mtu as u32 * MIN_CWND_IN_MSS
    }

    /// The cubic window at `elapsed` after entering congestion avoidance
    fn cubic_window(&self, elapsed_ms: u64) -> u64 {
        let mtu = self.mtu as u64;
        // W_cubic(t) = C*(t - K)^3 + W_max, computed in bytes
        let (delta_ms, grow) = if elapsed_ms >= self.k_ms {
            (elapsed_ms - self.k_ms, true)
        } else {
            (self.k_ms - elapsed_ms, false)
        };

        // C/10 * (delta/1000)^3 packets, without losing integer precision
        let offset = C_TIMES_TEN
            .saturating_mul(delta_ms)
            .saturating_mul(delta_ms)
            .saturating_mul(delta_ms)
            / 10
            / 1_000_000_000
            * mtu;

        if grow {
            (self.window_max as u64).saturating_add(offset)
        } else {
            (self.window_max as u64).saturating_sub(offset)
        }
    }

    fn on_congestion_event(&mut self, now: Timestamp) {
        self.end_of_recovery = Some(now);
        self.in_recovery = true;

        //= https://www.rfc-editor.org/rfc/rfc8312#section-4.6
        //# With fast convergence, when a congestion event occurs, before the
        //# window reduction of the congestion window, a flow remembers the last
        //# value of W_max.
        self.window_max = self.congestion_window;
        if self.window_max < self.window_last_max {
            self.window_last_max = self.window_max;
            self.window_max = self.window_max * 17 / 20;
        } else {
            self.window_last_max = self.window_max;
        }

        self.slow_start_threshold =
            ((self.congestion_window as u64 * BETA_TIMES_TEN / 10) as u32).max(self.min_cwnd());
        self.congestion_window = self.slow_start_threshold;
        self.phase = Phase::CongestionAvoidance;
        self.congestion_avoidance_start = None;
        self.aimd_window = self.congestion_window as u64;

        // K = cbrt(W_max * (1 - beta) / C / MTU) seconds
        let packets = self.window_max as u64 / self.mtu as u64;
        self.k_ms = cube_root(packets * (10 - BETA_TIMES_TEN) * 1_000_000_000 / C_TIMES_TEN / 10);
    }

    fn hystart_sample(&mut self, rtt: Duration, sent_time: Timestamp) {
        if !self.hystart_enabled || self.phase != Phase::SlowStart {
            return;
        }

        let new_round = match self.round_start {
            Some(start) => start <= sent_time,
            None => true,
        };
        if new_round {
            self.last_round_min_rtt = self.current_round_min_rtt;
            self.current_round_min_rtt = Duration::MAX;
            self.round_start = None;
        }
        self.current_round_min_rtt = self.current_round_min_rtt.min(rtt);

        if self.last_round_min_rtt != Duration::MAX
            && self.current_round_min_rtt
                >= self.last_round_min_rtt * HYSTART_RTT_GROWTH_NUM / HYSTART_RTT_GROWTH_DEN
                    + Duration::from_millis(4)
        {
            // delay is building: stop doubling and settle where we are
            self.slow_start_threshold = self.congestion_window;
            self.phase = Phase::CongestionAvoidance;
            self.window_max = self.congestion_window;
            self.window_last_max = self.congestion_window;
            self.aimd_window = self.congestion_window as u64;
            self.k_ms = 0;
        }
    }
}

impl CongestionControl for CubicCongestionControl {
    fn can_send(&self) -> bool {
        self.bytes_in_flight < self.congestion_window || self.exemptions > 0
    }

    fn set_exemption(&mut self, packets: u8) {
        self.exemptions = packets;
    }

    fn get_exemptions(&self) -> u8 {
        self.exemptions
    }

    fn reset(&mut self, mtu: u16, full_reset: bool) {
        let bytes_in_flight = if full_reset { 0 } else { self.bytes_in_flight };
        *self = Self::new(
            mtu,
            self.initial_congestion_window_packets,
            self.pacing_enabled,
            self.hystart_enabled,
        );
        self.bytes_in_flight = bytes_in_flight;
    }

    fn get_send_allowance(&mut self, time_since_last_send: Option<Duration>) -> u32 {
        if self.bytes_in_flight >= self.congestion_window {
            return 0;
        }
        let available = self.congestion_window - self.bytes_in_flight;

        let can_pace = self.pacing_enabled
            && time_since_last_send.is_some()
            && self.smoothed_rtt >= MIN_PACING_RTT;
        if !can_pace {
            return available;
        }

        // spread the window over the smoothed RTT
        let elapsed = time_since_last_send.expect("checked above");
        let allowance = self.congestion_window as u64 * elapsed.as_micros() as u64
            / self.smoothed_rtt.as_micros().max(1) as u64;

        (allowance as u32).min(available).min(self.congestion_window >> 2)
    }

    fn on_data_sent(&mut self, bytes: u32, _now: Timestamp) {
        self.bytes_in_flight += bytes;
        self.bytes_in_flight_max = self.bytes_in_flight_max.max(self.bytes_in_flight);
        if self.exemptions > 0 {
            self.exemptions -= 1;
        }
    }

    fn on_data_invalidated(&mut self, bytes: u32) -> bool {
        let previously_could_send = self.can_send();
        debug_assert!(self.bytes_in_flight >= bytes);
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
        !previously_could_send && self.can_send()
    }

    fn on_data_acknowledged(
        &mut self,
        event: &AckEvent,
        _rng: &mut dyn random::Generator,
    ) -> bool {
        let previously_could_send = self.can_send();

        if !event.is_implicit {
            debug_assert!(self.bytes_in_flight >= event.num_retransmittable_bytes);
            self.bytes_in_flight = self
                .bytes_in_flight
                .saturating_sub(event.num_retransmittable_bytes);
        }

        if let Some(rtt) = event.min_rtt_sample {
            if self.smoothed_rtt.is_zero() {
                self.smoothed_rtt = rtt;
            } else {
                self.smoothed_rtt = self.smoothed_rtt * 7 / 8 + rtt / 8;
            }
            self.hystart_sample(rtt, event.largest_acked_sent_time);
        }

        if self.in_recovery {
            let end = self.end_of_recovery.expect("in recovery");
            if end <= event.largest_acked_sent_time {
                self.in_recovery = false;
            } else {
                // acknowledged bytes during recovery do not grow the window
                return !previously_could_send && self.can_send();
            }
        }

        let acked = event.num_retransmittable_bytes;

        match self.phase {
            Phase::SlowStart => {
                self.congestion_window = self.congestion_window.saturating_add(acked);
                if self.congestion_window >= self.slow_start_threshold {
                    self.phase = Phase::CongestionAvoidance;
                    self.window_max = self.congestion_window;
                    self.window_last_max = self.congestion_window;
                    self.aimd_window = self.congestion_window as u64;
                    self.k_ms = 0;
                }
            }
            Phase::CongestionAvoidance => {
                let start = *self
                    .congestion_avoidance_start
                    .get_or_insert(event.now);
                let elapsed_ms = event.now.saturating_duration_since(start).as_millis() as u64;

                let target = self.cubic_window(elapsed_ms);

                // TCP-friendly AIMD companion
                if self.aimd_window > 0 {
                    self.aimd_window += self.mtu as u64 * acked as u64 / self.aimd_window;
                }

                let target = target.max(self.aimd_window);
                if target > self.congestion_window as u64 {
                    // approach the target over roughly one RTT of acks
                    let step = ((target - self.congestion_window as u64) * acked as u64
                        / self.congestion_window.max(1) as u64)
                        .max(1);
                    self.congestion_window =
                        (self.congestion_window as u64 + step).min(target) as u32;
                }
            }
        }

        !previously_could_send && self.can_send()
    }

    fn on_data_lost(&mut self, event: &LossEvent) -> bool {
        let previously_could_send = self.can_send();

        debug_assert!(self.bytes_in_flight >= event.num_retransmittable_bytes);
        self.bytes_in_flight = self
            .bytes_in_flight
            .saturating_sub(event.num_retransmittable_bytes);

        if !self.in_recovery {
            self.on_congestion_event(event.now);
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#section-7.6.2
        //# When persistent congestion is declared, the sender's congestion
        //# window MUST be reduced to the minimum congestion window.
        if event.persistent_congestion {
            self.congestion_window = self.mtu as u32 * PERSISTENT_CONGESTION_WINDOW_PACKETS;
            self.phase = Phase::SlowStart;
            self.slow_start_threshold = u32::MAX;
            self.in_recovery = false;
        }

        !previously_could_send && self.can_send()
    }

    fn on_spurious_congestion_event(&mut self) -> bool {
        if !self.in_recovery {
            return false;
        }
        let previously_could_send = self.can_send();

        // undo the reduction
        self.in_recovery = false;
        self.end_of_recovery = None;
        self.congestion_window = self.window_max.max(self.congestion_window);
        self.phase = Phase::SlowStart;
        self.slow_start_threshold = u32::MAX;

        !previously_could_send && self.can_send()
    }

    fn get_bytes_in_flight(&self) -> u32 {
        self.bytes_in_flight
    }

    fn get_bytes_in_flight_max(&self) -> u32 {
        self.bytes_in_flight_max
    }

    fn get_congestion_window(&self) -> u32 {
        self.congestion_window
    }

    fn is_app_limited(&self) -> bool {
        self.app_limited
    }

    fn set_app_limited(&mut self, _now: Timestamp) {
        if self.bytes_in_flight <= self.congestion_window {
            self.app_limited = true;
        }
    }

    fn update_mtu(&mut self, mtu: u16) {
        self.mtu = mtu;
    }

    fn log_out_flow_status(&self) {
        // surfaced through connection statistics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        random::testing::Generator,
        time::{Clock, NoopClock},
    };

    const MTU: u16 = 1280;

    fn ack(now: Timestamp, sent: Timestamp, bytes: u32) -> AckEvent<'static> {
        AckEvent {
            now,
            largest_acked_sent_time: sent,
            adjusted_ack_time: now,
            num_retransmittable_bytes: bytes,
            total_bytes_acked: bytes as u64,
            min_rtt_sample: Some(Duration::from_millis(40)),
            is_implicit: false,
            has_loss: false,
            is_largest_acked_packet_app_limited: false,
            acked_packets: &[],
        }
    }

    #[test]
    fn slow_start_doubles_per_round() {
        let mut cc = CubicCongestionControl::new(MTU, 10, false, false);
        let mut rng = Generator::default();
        let now = NoopClock.get_time();
        let window = cc.get_congestion_window();

        cc.on_data_sent(window, now);
        cc.on_data_acknowledged(&ack(now + Duration::from_millis(40), now, window), &mut rng);

        assert_eq!(cc.get_congestion_window(), window * 2);
    }

    #[test]
    fn loss_reduces_by_beta() {
        let mut cc = CubicCongestionControl::new(MTU, 10, false, false);
        let now = NoopClock.get_time();
        let window = cc.get_congestion_window();

        cc.on_data_sent(window, now);
        cc.on_data_lost(&LossEvent {
            now,
            num_retransmittable_bytes: MTU as u32,
            persistent_congestion: false,
        });

        assert_eq!(cc.get_congestion_window(), window * 7 / 10);
        assert!(cc.in_recovery);
    }

    #[test]
    fn persistent_congestion_collapses_to_minimum() {
        let mut cc = CubicCongestionControl::new(MTU, 10, false, false);
        let now = NoopClock.get_time();
        let window = cc.get_congestion_window();

        cc.on_data_sent(window, now);
        cc.on_data_lost(&LossEvent {
            now,
            num_retransmittable_bytes: window,
            persistent_congestion: true,
        });

        assert_eq!(
            cc.get_congestion_window(),
            MTU as u32 * PERSISTENT_CONGESTION_WINDOW_PACKETS
        );
    }

    #[test]
    fn recovery_blocks_growth_until_new_send_time() {
        let mut cc = CubicCongestionControl::new(MTU, 10, false, false);
        let mut rng = Generator::default();
        let mut now = NoopClock.get_time() + Duration::from_secs(1);

        cc.on_data_sent(MTU as u32 * 10, now);
        cc.on_data_lost(&LossEvent {
            now,
            num_retransmittable_bytes: MTU as u32,
            persistent_congestion: false,
        });
        let reduced = cc.get_congestion_window();

        // an ack for a pre-recovery packet does not grow the window
        cc.on_data_acknowledged(
            &ack(now, now - Duration::from_millis(1), MTU as u32),
            &mut rng,
        );
        assert_eq!(cc.get_congestion_window(), reduced);

        // an ack for a post-recovery packet exits recovery and grows
        now += Duration::from_millis(100);
        cc.on_data_acknowledged(&ack(now + Duration::from_millis(40), now, MTU as u32), &mut rng);
        assert!(!cc.in_recovery);
        assert!(cc.get_congestion_window() >= reduced);
    }

    #[test]
    fn spurious_event_restores_window() {
        let mut cc = CubicCongestionControl::new(MTU, 10, false, false);
        let now = NoopClock.get_time();
        let window = cc.get_congestion_window();

        cc.on_data_sent(window, now);
        cc.on_data_lost(&LossEvent {
            now,
            num_retransmittable_bytes: MTU as u32,
            persistent_congestion: false,
        });
        cc.on_spurious_congestion_event();

        assert_eq!(cc.get_congestion_window(), window);
        assert!(!cc.in_recovery);
    }

    #[test]
    fn cube_root_values() {
        assert_eq!(cube_root(0), 0);
        assert_eq!(cube_root(1), 1);
        assert_eq!(cube_root(27), 3);
        assert_eq!(cube_root(26), 2);
        assert_eq!(cube_root(1_000_000_000), 1000);
    }
}
