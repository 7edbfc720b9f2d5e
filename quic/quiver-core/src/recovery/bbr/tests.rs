// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::{
    random::testing::Generator,
    recovery::congestion_controller::{AckedPacketInfo, LastAckedPacketInfo},
    time::{Clock, NoopClock},
};

const MTU: u16 = 1280;

fn controller() -> BbrCongestionControl {
    BbrCongestionControl::new(MTU, 10, true)
}

fn ack_event<'a>(
    now: Timestamp,
    sent_time: Timestamp,
    bytes: u32,
    total: u64,
    packets: &'a [AckedPacketInfo],
) -> AckEvent<'a> {
    AckEvent {
        now,
        largest_acked_sent_time: sent_time,
        adjusted_ack_time: now,
        num_retransmittable_bytes: bytes,
        total_bytes_acked: total,
        min_rtt_sample: Some(Duration::from_millis(50)),
        is_implicit: false,
        has_loss: false,
        is_largest_acked_packet_app_limited: false,
        acked_packets: packets,
    }
}

fn acked_packet(sent_time: Timestamp, length: u32, total_sent: u64) -> AckedPacketInfo {
    AckedPacketInfo {
        sent_time,
        packet_length: length,
        is_app_limited: false,
        total_bytes_sent_then: total_sent,
        last_acked: None,
    }
}

/// A packet whose rate samples work out to `bytes` per `interval`,
/// regardless of connection lifetime totals
fn constant_rate_packet(
    sent_time: Timestamp,
    now: Timestamp,
    bytes: u32,
    interval: Duration,
    total_sent: u64,
    total_acked: u64,
) -> AckedPacketInfo {
    AckedPacketInfo {
        sent_time,
        packet_length: bytes,
        is_app_limited: false,
        total_bytes_sent_then: total_sent,
        last_acked: Some(LastAckedPacketInfo {
            sent_time: sent_time - interval,
            ack_time: now - interval,
            adjusted_ack_time: now - interval,
            total_bytes_sent: total_sent - bytes as u64,
            total_bytes_acked: total_acked - bytes as u64,
        }),
    }
}

#[test]
fn initial_window_and_can_send() {
    let mut cc = controller();
    assert_eq!(cc.get_congestion_window(), MTU as u32 * 10);
    assert!(cc.can_send());

    let now = NoopClock.get_time();
    cc.on_data_sent(MTU as u32 * 10, now);
    assert!(!cc.can_send());

    // exemptions bypass the window
    cc.set_exemption(1);
    assert!(cc.can_send());
}

#[test]
fn send_allowance_without_pacing_state() {
    let mut cc = controller();
    let now = NoopClock.get_time();

    // no min-rtt yet: the full remaining window is allowed
    assert_eq!(
        cc.get_send_allowance(Some(Duration::from_millis(1))),
        MTU as u32 * 10
    );

    cc.on_data_sent(MTU as u32 * 4, now);
    assert_eq!(
        cc.get_send_allowance(Some(Duration::from_millis(1))),
        MTU as u32 * 6
    );

    cc.on_data_sent(MTU as u32 * 6, now);
    assert_eq!(cc.get_send_allowance(Some(Duration::from_millis(1))), 0);
}

#[test]
fn startup_exits_to_drain_after_slow_rounds() {
    let mut cc = controller();
    let mut rng = Generator::default();
    let mut now = NoopClock.get_time() + Duration::from_secs(1);
    let mut total_acked = 0u64;
    let mut total_sent = 0u64;

    assert_eq!(cc.state, State::Startup);

    // steady bandwidth: every round trip reports the same estimate, so
    // growth stalls and the bottleneck is declared after three rounds
    for round in 0..8u64 {
        now += Duration::from_millis(50);
        let sent_time = now - Duration::from_millis(25);
        total_sent += 10_000;
        total_acked += 10_000;
        cc.on_data_sent(10_000, sent_time);

        let packets = [constant_rate_packet(
            sent_time,
            now,
            10_000,
            Duration::from_millis(50),
            total_sent,
            total_acked,
        )];
        let event = ack_event(now, sent_time, 10_000, total_acked, &packets);
        cc.on_data_acknowledged(&event, &mut rng);

        if cc.state != State::Startup {
            assert!(round >= 3, "exited startup too early (round {round})");
            break;
        }
    }

    assert!(cc.btlbw_found);
    assert_ne!(cc.state, State::Startup);
}

#[test]
fn drain_exits_to_probe_bw_when_inflight_reaches_target() {
    let mut cc = controller();
    let mut rng = Generator::default();
    let mut now = NoopClock.get_time() + Duration::from_secs(1);
    let mut total = 0u64;

    // force the bottleneck-found edge
    for _ in 0..6u64 {
        now += Duration::from_millis(50);
        let sent_time = now - Duration::from_millis(25);
        total += 10_000;
        cc.on_data_sent(10_000, sent_time);
        let packets = [constant_rate_packet(
            sent_time,
            now,
            10_000,
            Duration::from_millis(50),
            total,
            total,
        )];
        let event = ack_event(now, sent_time, 10_000, total, &packets);
        cc.on_data_acknowledged(&event, &mut rng);
    }

    // everything acked: inflight (0) is at or below any target
    assert_eq!(cc.get_bytes_in_flight(), 0);
    assert_eq!(cc.state, State::ProbeBw);
    // the random cycle start never lands on the drain entry
    assert_ne!(cc.pacing_cycle_index, 1);
}

#[test]
fn loss_enters_conservative_recovery() {
    let mut cc = controller();
    let now = NoopClock.get_time();

    cc.on_data_sent(MTU as u32 * 8, now);

    let event = LossEvent {
        now,
        num_retransmittable_bytes: MTU as u32,
        persistent_congestion: false,
    };
    cc.on_data_lost(&event);

    assert_eq!(cc.recovery_state, RecoveryState::Conservative);
    // the window holds near bytes in flight, less the lost bytes
    assert_eq!(cc.get_congestion_window(), MTU as u32 * 6);
}

#[test]
fn persistent_congestion_collapses_window() {
    let mut cc = controller();
    let now = NoopClock.get_time();

    cc.on_data_sent(MTU as u32 * 10, now);

    let event = LossEvent {
        now,
        num_retransmittable_bytes: MTU as u32 * 10,
        persistent_congestion: true,
    };
    cc.on_data_lost(&event);

    assert_eq!(cc.get_congestion_window(), MTU as u32 * MIN_CWND_IN_MSS);
}

#[test]
fn probe_rtt_pins_window() {
    let mut cc = controller();
    cc.state = State::ProbeRtt;
    assert_eq!(cc.get_congestion_window(), MTU as u32 * MIN_CWND_IN_MSS);
}

#[test]
fn min_rtt_sample_expires() {
    let mut sampler = MinRttSampler::new();
    let mut now = NoopClock.get_time();

    assert!(sampler.new_rtt_sample(Duration::from_millis(50), now));
    // a larger sample is rejected while fresh
    now += Duration::from_secs(1);
    assert!(!sampler.new_rtt_sample(Duration::from_millis(80), now));
    assert!(!sampler.sample_expired);

    // after the expiration the larger sample replaces the minimum
    now += MIN_RTT_EXPIRATION;
    assert!(sampler.new_rtt_sample(Duration::from_millis(80), now));
    assert!(sampler.sample_expired);
}

#[test]
fn allowance_is_bounded_by_quarter_window() {
    let mut cc = controller();
    let mut rng = Generator::default();
    let mut now = NoopClock.get_time();
    let mut total = 0u64;

    // establish bandwidth and min-rtt so pacing engages
    for _ in 0..3u64 {
        let sent_time = now;
        now += Duration::from_millis(50);
        total += 50_000;
        cc.on_data_sent(50_000, sent_time);
        let packets = [acked_packet(sent_time, 50_000, total)];
        let event = ack_event(now, sent_time, 50_000, total, &packets);
        cc.on_data_acknowledged(&event, &mut rng);
    }

    let window = cc.get_congestion_window();
    let allowance = cc.get_send_allowance(Some(Duration::from_secs(5)));
    assert!(allowance <= window / 4 + 1, "{allowance} > {window}/4");
}
