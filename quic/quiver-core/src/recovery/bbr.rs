// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A congestion controller implementing "Bottleneck Bandwidth and
//! Round-trip propagation time".
//!
//! The controller cycles through four states: `Startup` grows aggressively
//! until bandwidth stops improving, `Drain` empties the queue Startup
//! built, `ProbeBw` oscillates its pacing gain around the estimate, and
//! `ProbeRtt` periodically shrinks the window to refresh the min-RTT
//! sample.

use crate::{
    random,
    recovery::{
        congestion_controller::{AckEvent, CongestionControl, LossEvent},
        windowed_filter::WindowedFilter,
    },
    time::Timestamp,
};
use core::time::Duration;

/// Fixed-point unit for gain values
pub const BBR_UNIT: u64 = 256;
/// Fixed-point shift applied to bandwidth values (bytes per second)
const BW_UNIT: u64 = 8;

const MICROS_PER_SEC: u64 = 1_000_000;

/// 2/ln(2), the high gain used while the pipe is still unknown
const STARTUP_GAIN: u64 = BBR_UNIT * 2885 / 1000 + 1;
/// The inverse, used to drain the queue built during startup
const DRAIN_GAIN: u64 = BBR_UNIT * 1000 / 2885;
/// Cwnd gain while probing bandwidth
const PROBE_BW_GAIN: u64 = BBR_UNIT * 2;

/// Bandwidth must grow by this factor per round to keep startup going
const EXPECTED_STARTUP_GROWTH: u64 = BBR_UNIT * 5 / 4;
/// Rounds without expected growth before the bottleneck is declared found
const STARTUP_SLOW_GROW_ROUND_LIMIT: u8 = 3;

const NUM_CYCLES: usize = 8;
/// The ProbeBw pacing-gain cycle; one entry per min-RTT
const PACING_GAIN_CYCLES: [u64; NUM_CYCLES] = [
    BBR_UNIT * 5 / 4,
    BBR_UNIT * 3 / 4,
    BBR_UNIT,
    BBR_UNIT,
    BBR_UNIT,
    BBR_UNIT,
    BBR_UNIT,
    BBR_UNIT,
];

/// Time spent at the reduced window in ProbeRtt
const PROBE_RTT_DURATION: Duration = Duration::from_millis(200);

/// Rounds of history the bandwidth and ack-height filters retain
const BANDWIDTH_WINDOW_LENGTH: u64 = NUM_CYCLES as u64 + 2;

/// The min-RTT sample goes stale after this long
const MIN_RTT_EXPIRATION: Duration = Duration::from_secs(10);

/// Floor of the congestion and recovery windows, in packets
const MIN_CWND_IN_MSS: u32 = 4;
/// Initial recovery window, in packets
const DEFAULT_RECOVERY_CWND_IN_MSS: u32 = 2000;

/// Pacing rates below this use a single-MTU send quantum
const LOW_PACING_RATE_FOR_SEND_QUANTUM: u64 = 1200 * 1000; // bytes/sec
/// Pacing rates below this use a two-MTU send quantum
const HIGH_PACING_RATE_FOR_SEND_QUANTUM: u64 = 24 * 1000 * 1000; // bytes/sec

const K_64K: u64 = 64 * 1024;

/// Number of send quanta added on top of the BDP when sizing the window
const QUANTA_FACTOR: u64 = 3;

/// Pacing engages only when the RTT clears this floor
const MIN_PACING_RTT: Duration = Duration::from_millis(1);

/// Converts a byte count over an interval into fixed-point bandwidth
#[inline]
fn bandwidth(bytes: u64, interval: Duration) -> Option<u64> {
    let micros = interval.as_micros() as u64;
    if micros == 0 {
        return None;
    }
    Some(MICROS_PER_SEC * BW_UNIT * bytes / micros)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Startup,
    Drain,
    ProbeBw,
    ProbeRtt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecoveryState {
    NotRecovery,
    /// Hold the recovery window at bytes in flight
    Conservative,
    /// Grow the recovery window by acknowledged bytes
    Growth,
}

/// Tracks the minimum RTT with a hard expiration
#[derive(Clone, Copy, Debug)]
struct MinRttSampler {
    min_rtt: Option<Duration>,
    timestamp: Option<Timestamp>,
    sample_expired: bool,
}

impl MinRttSampler {
    fn new() -> Self {
        Self {
            min_rtt: None,
            timestamp: None,
            sample_expired: true,
        }
    }

    /// Returns true if the sample was adopted as the new minimum
    fn new_rtt_sample(&mut self, sample: Duration, now: Timestamp) -> bool {
        self.sample_expired = match self.timestamp {
            Some(timestamp) => timestamp + MIN_RTT_EXPIRATION <= now,
            None => false,
        };

        if self.sample_expired || self.min_rtt.map_or(true, |min| min > sample) {
            self.min_rtt = Some(sample);
            self.timestamp = Some(now);
            return true;
        }
        false
    }
}

/// Produces bandwidth samples from acknowledged packets
#[derive(Clone, Debug)]
struct BandwidthSampler {
    filter: WindowedFilter,
    app_limited: bool,
    app_limited_exit_target: Option<Timestamp>,
}

impl BandwidthSampler {
    fn new() -> Self {
        Self {
            filter: WindowedFilter::new(BANDWIDTH_WINDOW_LENGTH),
            app_limited: false,
            app_limited_exit_target: None,
        }
    }

    fn on_app_limited(&mut self, now: Timestamp) {
        self.app_limited = true;
        self.app_limited_exit_target = Some(now);
    }

    fn on_packet_acked(&mut self, event: &AckEvent, round_trip_counter: u64) {
        if let Some(exit_target) = self.app_limited_exit_target {
            if self.app_limited && exit_target <= event.largest_acked_sent_time {
                self.app_limited = false;
            }
        }

        for packet in event.acked_packets {
            if packet.packet_length == 0 {
                continue;
            }

            let mut send_rate = None;
            let mut ack_rate = None;

            if let Some(last) = packet.last_acked {
                debug_assert!(packet.total_bytes_sent_then >= last.total_bytes_sent);
                send_rate = bandwidth(
                    packet.total_bytes_sent_then - last.total_bytes_sent,
                    packet.sent_time.saturating_duration_since(last.sent_time),
                );

                let ack_duration = if event.adjusted_ack_time > last.adjusted_ack_time {
                    event
                        .adjusted_ack_time
                        .saturating_duration_since(last.adjusted_ack_time)
                } else {
                    event.now.saturating_duration_since(last.ack_time)
                };
                debug_assert!(event.total_bytes_acked >= last.total_bytes_acked);
                ack_rate = bandwidth(
                    event.total_bytes_acked - last.total_bytes_acked,
                    ack_duration,
                );
            } else if packet.sent_time <= event.now {
                send_rate = bandwidth(
                    event.total_bytes_acked,
                    event.now.saturating_duration_since(packet.sent_time),
                );
            }

            let measured_bw = match (send_rate, ack_rate) {
                (Some(send), Some(ack)) => send.min(ack),
                (Some(rate), None) | (None, Some(rate)) => rate,
                (None, None) => continue,
            };

            // app-limited samples only count when they raise the estimate
            if measured_bw >= self.filter.best() || !packet.is_app_limited {
                self.filter.update(measured_bw, round_trip_counter);
            }
        }
    }
}

/// The BBR congestion controller
#[derive(Clone, Debug)]
pub struct BbrCongestionControl {
    state: State,
    recovery_state: RecoveryState,

    mtu: u16,
    pacing_enabled: bool,

    bytes_in_flight: u32,
    bytes_in_flight_max: u32,
    exemptions: u8,

    congestion_window: u32,
    initial_congestion_window: u32,
    initial_congestion_window_packets: u32,
    recovery_window: u32,

    min_rtt_sampler: MinRttSampler,
    bandwidth_sampler: BandwidthSampler,
    max_ack_height_filter: WindowedFilter,

    /// Fixed-point (BBR_UNIT) gains
    cwnd_gain: u64,
    pacing_gain: u64,

    round_trip_counter: u64,
    end_of_round_trip: Option<Timestamp>,

    btlbw_found: bool,
    previous_startup_bandwidth: u64,
    slow_startup_round_counter: u8,

    pacing_cycle_index: usize,
    cycle_start: Option<Timestamp>,

    send_quantum: u64,

    aggregated_ack_bytes: u64,
    ack_aggregation_start_time: Option<Timestamp>,

    end_of_recovery: Option<Timestamp>,

    earliest_time_to_exit_probe_rtt: Option<Timestamp>,
    probe_rtt_round: Option<u64>,

    exiting_quiescence: bool,
    app_limited_since_probe_rtt: bool,
    probe_rtt_exit_pending: bool,
}

impl BbrCongestionControl {
    pub fn new(mtu: u16, initial_window_packets: u32, pacing_enabled: bool) -> Self {
        let initial_congestion_window = mtu as u32 * initial_window_packets;
        Self {
            state: State::Startup,
            recovery_state: RecoveryState::NotRecovery,
            mtu,
            pacing_enabled,
            bytes_in_flight: 0,
            bytes_in_flight_max: initial_congestion_window / 2,
            exemptions: 0,
            congestion_window: initial_congestion_window,
            initial_congestion_window,
            initial_congestion_window_packets: initial_window_packets,
            recovery_window: mtu as u32 * DEFAULT_RECOVERY_CWND_IN_MSS,
            min_rtt_sampler: MinRttSampler::new(),
            bandwidth_sampler: BandwidthSampler::new(),
            max_ack_height_filter: WindowedFilter::new(BANDWIDTH_WINDOW_LENGTH),
            cwnd_gain: STARTUP_GAIN,
            pacing_gain: STARTUP_GAIN,
            round_trip_counter: 0,
            end_of_round_trip: None,
            btlbw_found: false,
            previous_startup_bandwidth: 0,
            slow_startup_round_counter: 0,
            pacing_cycle_index: 0,
            cycle_start: None,
            send_quantum: 0,
            aggregated_ack_bytes: 0,
            ack_aggregation_start_time: None,
            end_of_recovery: None,
            earliest_time_to_exit_probe_rtt: None,
            probe_rtt_round: None,
            exiting_quiescence: false,
            app_limited_since_probe_rtt: false,
            probe_rtt_exit_pending: false,
        }
    }

    /// The current bottleneck bandwidth estimate, fixed point
    #[inline]
    fn bandwidth_estimate(&self) -> u64 {
        self.bandwidth_sampler.filter.best()
    }

    #[inline]
    fn min_cwnd(&self) -> u32 {
        self.mtu as u32 * MIN_CWND_IN_MSS
    }

    fn effective_congestion_window(&self) -> u32 {
        if self.state == State::ProbeRtt {
            return self.min_cwnd();
        }
        if self.recovery_state != RecoveryState::NotRecovery {
            return self.congestion_window.min(self.recovery_window);
        }
        self.congestion_window
    }

    fn target_cwnd(&self, gain: u64) -> u32 {
        let bandwidth_est = self.bandwidth_estimate();
        let min_rtt = self.min_rtt_sampler.min_rtt;

        let Some(min_rtt) = min_rtt else {
            return (gain * self.initial_congestion_window as u64 / BBR_UNIT) as u32;
        };
        if bandwidth_est == 0 {
            return (gain * self.initial_congestion_window as u64 / BBR_UNIT) as u32;
        }

        let bdp = bandwidth_est * min_rtt.as_micros() as u64 / MICROS_PER_SEC / BW_UNIT;
        (bdp * gain / BBR_UNIT + QUANTA_FACTOR * self.send_quantum) as u32
    }

    fn bounded_cwnd(&self, cwnd: u32) -> u32 {
        cwnd.max(self.min_cwnd())
    }

    fn pick_random_cycle(&mut self, rng: &mut dyn random::Generator) -> usize {
        // start anywhere except the drain-gain entry
        let value = random::gen_range(rng, (NUM_CYCLES - 1) as u64) as usize;
        self.pacing_cycle_index = (value + 2) % NUM_CYCLES;
        debug_assert_ne!(self.pacing_cycle_index, 1);
        self.pacing_cycle_index
    }

    fn transit_to_probe_bw(&mut self, now: Timestamp, rng: &mut dyn random::Generator) {
        self.state = State::ProbeBw;
        self.cwnd_gain = PROBE_BW_GAIN;
        let index = self.pick_random_cycle(rng);
        self.pacing_gain = PACING_GAIN_CYCLES[index];
        self.cycle_start = Some(now);
    }

    fn transit_to_startup(&mut self) {
        self.state = State::Startup;
        self.pacing_gain = STARTUP_GAIN;
        self.cwnd_gain = STARTUP_GAIN;
    }

    fn transit_to_drain(&mut self) {
        self.state = State::Drain;
        self.pacing_gain = DRAIN_GAIN;
        self.cwnd_gain = STARTUP_GAIN;
    }

    fn transit_to_probe_rtt(&mut self, now: Timestamp) {
        self.state = State::ProbeRtt;
        self.pacing_gain = BBR_UNIT;
        self.earliest_time_to_exit_probe_rtt = None;
        self.probe_rtt_round = None;
        self.bandwidth_sampler.on_app_limited(now);
        self.app_limited_since_probe_rtt = false;
    }

    /// Advances the round-trip counter when the acked packet was sent after
    /// the previous round ended
    fn update_round_trip_counter(
        &mut self,
        largest_acked_sent_time: Timestamp,
        now: Timestamp,
    ) -> bool {
        let new_round = match self.end_of_round_trip {
            Some(end) => end <= largest_acked_sent_time,
            None => true,
        };
        if new_round {
            self.round_trip_counter += 1;
            self.end_of_round_trip = Some(now);
        }
        new_round
    }

    fn update_recovery_window_with_ack(&mut self, bytes_acked: u32) {
        debug_assert!(self.recovery_state != RecoveryState::NotRecovery);

        if self.recovery_state == RecoveryState::Growth {
            self.recovery_window += bytes_acked;
        }

        self.recovery_window = self
            .recovery_window
            .max(self.bytes_in_flight + bytes_acked);
        self.recovery_window = self.bounded_cwnd(self.recovery_window);
    }

    /// Measures ack arrival in excess of the estimated bandwidth
    fn update_ack_aggregation(&mut self, event: &AckEvent) -> u64 {
        let Some(start_time) = self.ack_aggregation_start_time else {
            return 0;
        };

        let expected_ack_bytes = self.bandwidth_estimate()
            * event.now.saturating_duration_since(start_time).as_micros() as u64
            / MICROS_PER_SEC
            / BW_UNIT;

        // aggregation starts when acks arrive slower than the estimate
        if self.aggregated_ack_bytes <= expected_ack_bytes {
            self.aggregated_ack_bytes = event.num_retransmittable_bytes as u64;
            self.ack_aggregation_start_time = Some(event.now);
            return 0;
        }

        self.aggregated_ack_bytes += event.num_retransmittable_bytes as u64;
        let excess = self.aggregated_ack_bytes - expected_ack_bytes;
        self.max_ack_height_filter
            .update(excess, self.round_trip_counter);
        excess
    }

    fn handle_ack_in_probe_bw(
        &mut self,
        now: Timestamp,
        prev_inflight_bytes: u32,
        has_loss: bool,
    ) {
        let min_rtt = self.min_rtt_sampler.min_rtt.unwrap_or(Duration::MAX);

        // at least one min-RTT must have elapsed since the cycle started
        let mut should_advance = match self.cycle_start {
            Some(cycle_start) => now.saturating_duration_since(cycle_start) > min_rtt,
            None => false,
        };

        if self.pacing_gain > BBR_UNIT
            && !has_loss
            && prev_inflight_bytes < self.target_cwnd(self.pacing_gain)
        {
            // probing: stay in the cycle until inflight reaches the target
            should_advance = false;
        }

        if self.pacing_gain < BBR_UNIT && self.bytes_in_flight <= self.target_cwnd(BBR_UNIT) {
            // draining: done as soon as inflight reaches the target
            should_advance = true;
        }

        if should_advance {
            self.pacing_cycle_index = (self.pacing_cycle_index + 1) % NUM_CYCLES;
            self.cycle_start = Some(now);
            self.pacing_gain = PACING_GAIN_CYCLES[self.pacing_cycle_index];
        }
    }

    /// Declares the bottleneck found after three rounds without 25% growth
    fn detect_bottleneck_bandwidth(&mut self, is_app_limited: bool) {
        if self.btlbw_found || is_app_limited {
            return;
        }

        let bandwidth_target = self.previous_startup_bandwidth * EXPECTED_STARTUP_GROWTH / BBR_UNIT;
        let real_bandwidth = self.bandwidth_estimate();

        if real_bandwidth >= bandwidth_target {
            self.previous_startup_bandwidth = real_bandwidth;
            self.slow_startup_round_counter = 0;
            return;
        }

        self.slow_startup_round_counter += 1;
        if self.slow_startup_round_counter >= STARTUP_SLOW_GROW_ROUND_LIMIT {
            self.btlbw_found = true;
        }
    }

    fn should_exit_drain(&self) -> bool {
        self.state == State::Drain && self.bytes_in_flight <= self.target_cwnd(BBR_UNIT)
    }

    fn should_probe_rtt(&self) -> bool {
        self.state != State::ProbeRtt
            && !self.exiting_quiescence
            && self.min_rtt_sampler.sample_expired
    }

    fn handle_ack_in_probe_rtt(&mut self, new_round_trip: bool, ack_time: Timestamp) {
        self.bandwidth_sampler.on_app_limited(ack_time);

        if self.earliest_time_to_exit_probe_rtt.is_none()
            && self.bytes_in_flight < self.effective_congestion_window() + self.mtu as u32
        {
            self.earliest_time_to_exit_probe_rtt = Some(ack_time + PROBE_RTT_DURATION);
            self.probe_rtt_round = None;
            return;
        }

        if self.earliest_time_to_exit_probe_rtt.is_some() {
            if self.probe_rtt_round.is_none() && new_round_trip {
                self.probe_rtt_round = Some(self.round_trip_counter);
            }

            if self.probe_rtt_round.is_some()
                && self
                    .earliest_time_to_exit_probe_rtt
                    .expect("checked above")
                    .has_elapsed(ack_time)
            {
                self.min_rtt_sampler.timestamp = Some(ack_time);

                // the caller re-checks state and finishes the transition
                self.probe_rtt_exit_pending = true;
            }
        }
    }

    fn update_congestion_window(&mut self, total_bytes_acked: u64, acked_bytes: u32) {
        if self.state == State::ProbeRtt {
            return;
        }

        let bandwidth = self.bandwidth_estimate();
        let pacing_rate = bandwidth * self.pacing_gain / BBR_UNIT;

        if pacing_rate < LOW_PACING_RATE_FOR_SEND_QUANTUM * BW_UNIT {
            self.send_quantum = self.mtu as u64;
        } else if pacing_rate < HIGH_PACING_RATE_FOR_SEND_QUANTUM * BW_UNIT {
            self.send_quantum = self.mtu as u64 * 2;
        } else {
            // one millisecond's worth of the pacing rate, capped at 64K
            self.send_quantum = (pacing_rate / BW_UNIT / 1000).min(K_64K);
        }

        let mut target_cwnd = self.target_cwnd(self.cwnd_gain) as u64;
        if self.btlbw_found {
            target_cwnd += self.max_ack_height_filter.best();
        }

        if self.btlbw_found {
            self.congestion_window =
                (target_cwnd.min(self.congestion_window as u64 + acked_bytes as u64)) as u32;
        } else if (self.congestion_window as u64) < target_cwnd
            || total_bytes_acked < self.initial_congestion_window as u64
        {
            self.congestion_window += acked_bytes;
        }

        self.congestion_window = self.bounded_cwnd(self.congestion_window);
    }

    fn update_blocked_state(&mut self, previously_could_send: bool) -> bool {
        // became unblocked only on a blocked -> unblocked edge
        !previously_could_send && self.can_send()
    }
}

impl CongestionControl for BbrCongestionControl {
    fn can_send(&self) -> bool {
        self.bytes_in_flight < self.effective_congestion_window() || self.exemptions > 0
    }

    fn set_exemption(&mut self, packets: u8) {
        self.exemptions = packets;
    }

    fn get_exemptions(&self) -> u8 {
        self.exemptions
    }

    fn reset(&mut self, mtu: u16, full_reset: bool) {
        let bytes_in_flight = if full_reset { 0 } else { self.bytes_in_flight };
        *self = Self::new(mtu, self.initial_congestion_window_packets, self.pacing_enabled);
        self.bytes_in_flight = bytes_in_flight;
    }

    fn get_send_allowance(&mut self, time_since_last_send: Option<Duration>) -> u32 {
        let congestion_window = self.effective_congestion_window();

        if self.bytes_in_flight >= congestion_window {
            return 0;
        }

        let min_rtt = self.min_rtt_sampler.min_rtt;
        let can_pace = self.pacing_enabled
            && time_since_last_send.is_some()
            && min_rtt.map_or(false, |rtt| rtt >= MIN_PACING_RTT);

        if !can_pace {
            return congestion_window - self.bytes_in_flight;
        }

        let elapsed = time_since_last_send.expect("checked above").as_micros() as u64;
        let bandwidth_est = self.bandwidth_estimate();

        let mut allowance = if self.state == State::Startup {
            // startup paces off the window as well, so a slow estimate
            // cannot stall the ramp
            let paced = bandwidth_est * self.pacing_gain * elapsed
                / BBR_UNIT
                / MICROS_PER_SEC
                / BW_UNIT;
            let window_share = (congestion_window as u64 * self.pacing_gain / BBR_UNIT)
                .saturating_sub(self.bytes_in_flight as u64);
            paced.max(window_share)
        } else {
            bandwidth_est * self.pacing_gain * elapsed / BBR_UNIT / MICROS_PER_SEC / BW_UNIT
        } as u32;

        allowance = allowance.min(congestion_window - self.bytes_in_flight);
        // bound a single flush to a quarter of the window
        allowance.min(congestion_window >> 2)
    }

    fn on_data_sent(&mut self, bytes: u32, now: Timestamp) {
        let previously_could_send = self.can_send();

        if self.bytes_in_flight == 0 && self.is_app_limited() {
            self.exiting_quiescence = true;
        }

        self.bytes_in_flight += bytes;
        self.bytes_in_flight_max = self.bytes_in_flight_max.max(self.bytes_in_flight);

        if self.ack_aggregation_start_time.is_none() {
            self.ack_aggregation_start_time = Some(now);
        }

        if self.exemptions > 0 {
            self.exemptions -= 1;
        }

        let _ = self.update_blocked_state(previously_could_send);
    }

    fn on_data_invalidated(&mut self, bytes: u32) -> bool {
        let previously_could_send = self.can_send();

        debug_assert!(self.bytes_in_flight >= bytes);
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);

        self.update_blocked_state(previously_could_send)
    }

    fn on_data_acknowledged(&mut self, event: &AckEvent, rng: &mut dyn random::Generator) -> bool {
        let previously_could_send = self.can_send();

        if event.is_implicit {
            self.update_congestion_window(
                event.total_bytes_acked,
                event.num_retransmittable_bytes,
            );
            return self.update_blocked_state(previously_could_send);
        }

        let prev_inflight_bytes = self.bytes_in_flight;

        debug_assert!(self.bytes_in_flight >= event.num_retransmittable_bytes);
        self.bytes_in_flight = self
            .bytes_in_flight
            .saturating_sub(event.num_retransmittable_bytes);

        if let Some(sample) = event.min_rtt_sample {
            if self.min_rtt_sampler.new_rtt_sample(sample, event.now) {
                self.app_limited_since_probe_rtt = false;
            }
        }

        let new_round_trip =
            self.update_round_trip_counter(event.largest_acked_sent_time, event.now);

        let largest_acked_app_limited =
            !event.acked_packets.is_empty() && event.is_largest_acked_packet_app_limited;

        self.bandwidth_sampler
            .on_packet_acked(event, self.round_trip_counter);

        if self.recovery_state != RecoveryState::NotRecovery {
            debug_assert!(self.end_of_recovery.is_some());
            if new_round_trip && self.recovery_state != RecoveryState::Growth {
                self.recovery_state = RecoveryState::Growth;
            }
            let end_of_recovery = self.end_of_recovery.expect("in recovery");
            if end_of_recovery <= event.largest_acked_sent_time {
                self.recovery_state = RecoveryState::NotRecovery;
            } else {
                self.update_recovery_window_with_ack(event.num_retransmittable_bytes);
            }
        }

        self.update_ack_aggregation(event);

        if self.state == State::ProbeBw {
            self.handle_ack_in_probe_bw(event.now, prev_inflight_bytes, event.has_loss);
        }

        if new_round_trip && !largest_acked_app_limited {
            self.detect_bottleneck_bandwidth(largest_acked_app_limited);
        }

        if self.state == State::Startup && self.btlbw_found {
            self.transit_to_drain();
        }

        if self.should_exit_drain() {
            self.transit_to_probe_bw(event.now, rng);
        }

        if self.should_probe_rtt() {
            self.transit_to_probe_rtt(event.now);
        }

        self.exiting_quiescence = false;

        if self.state == State::ProbeRtt {
            self.probe_rtt_exit_pending = false;
            self.handle_ack_in_probe_rtt(new_round_trip, event.now);
            if self.probe_rtt_exit_pending {
                if self.btlbw_found {
                    self.transit_to_probe_bw(event.now, rng);
                } else {
                    self.transit_to_startup();
                }
            }
        }

        self.update_congestion_window(event.total_bytes_acked, event.num_retransmittable_bytes);

        self.update_blocked_state(previously_could_send)
    }

    fn on_data_lost(&mut self, event: &LossEvent) -> bool {
        let previously_could_send = self.can_send();

        self.end_of_recovery = Some(event.now);

        debug_assert!(self.bytes_in_flight >= event.num_retransmittable_bytes);
        self.bytes_in_flight = self
            .bytes_in_flight
            .saturating_sub(event.num_retransmittable_bytes);

        if self.recovery_state == RecoveryState::NotRecovery {
            // a fresh loss opens recovery in its conservative phase
            self.recovery_state = RecoveryState::Conservative;
            self.recovery_window = self.bounded_cwnd(self.bytes_in_flight);
            self.end_of_round_trip = Some(event.now);
        }

        let floor = event.num_retransmittable_bytes + self.min_cwnd();
        self.recovery_window = if self.recovery_window > floor {
            self.recovery_window - event.num_retransmittable_bytes
        } else {
            self.min_cwnd()
        };

        if event.persistent_congestion {
            self.recovery_window = self.min_cwnd();
        }

        self.update_blocked_state(previously_could_send)
    }

    fn on_spurious_congestion_event(&mut self) -> bool {
        false
    }

    fn get_bytes_in_flight(&self) -> u32 {
        self.bytes_in_flight
    }

    fn get_bytes_in_flight_max(&self) -> u32 {
        self.bytes_in_flight_max
    }

    fn get_congestion_window(&self) -> u32 {
        self.effective_congestion_window()
    }

    fn is_app_limited(&self) -> bool {
        self.bandwidth_sampler.app_limited
    }

    fn set_app_limited(&mut self, now: Timestamp) {
        if self.bytes_in_flight > self.effective_congestion_window() {
            return;
        }
        self.app_limited_since_probe_rtt = true;
        self.bandwidth_sampler.on_app_limited(now);
    }

    fn update_mtu(&mut self, mtu: u16) {
        self.mtu = mtu;
    }

    fn log_out_flow_status(&self) {
        // surfaced through connection statistics
    }
}

#[cfg(test)]
mod tests;
