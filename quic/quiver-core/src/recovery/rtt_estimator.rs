// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    packet::number::PacketNumberSpace,
    recovery::{time_reorder_threshold, PERSISTENT_CONGESTION_THRESHOLD},
    time::Timestamp,
};
use core::time::Duration;

//= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.2
//# If no previous RTT is available, the initial RTT
//# SHOULD be set to 333 milliseconds.

/// The RTT assumed before any sample exists
pub const DEFAULT_INITIAL_RTT: Duration = Duration::from_millis(333);

/// Timer granularity floor
pub const K_GRANULARITY: Duration = Duration::from_millis(1);

/// Standard min/smoothed/variance RTT estimation per RFC 9002 §5
#[derive(Clone, Copy, Debug)]
pub struct RttEstimator {
    latest_rtt: Duration,
    min_rtt: Duration,
    smoothed_rtt: Duration,
    rttvar: Duration,
    max_ack_delay: Duration,
    first_rtt_sample: Option<Timestamp>,
}

impl RttEstimator {
    pub fn new(initial_rtt: Duration) -> Self {
        Self {
            latest_rtt: Duration::ZERO,
            min_rtt: initial_rtt,
            smoothed_rtt: initial_rtt,
            rttvar: initial_rtt / 2,
            max_ack_delay: Duration::ZERO,
            first_rtt_sample: None,
        }
    }

    #[inline]
    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    #[inline]
    pub fn min_rtt(&self) -> Duration {
        self.min_rtt
    }

    #[inline]
    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed_rtt
    }

    #[inline]
    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    #[inline]
    pub fn first_rtt_sample(&self) -> Option<Timestamp> {
        self.first_rtt_sample
    }

    /// Records the peer's max_ack_delay transport parameter
    #[inline]
    pub fn on_max_ack_delay(&mut self, max_ack_delay: Duration) {
        self.max_ack_delay = max_ack_delay;
    }

    #[inline]
    pub fn max_ack_delay(&self) -> Duration {
        self.max_ack_delay
    }

    /// Incorporates an RTT sample from a newly-acknowledged,
    /// newest-acknowledged packet
    pub fn update_rtt(
        &mut self,
        latest_rtt: Duration,
        ack_delay: Duration,
        now: Timestamp,
        is_handshake_confirmed: bool,
    ) {
        self.latest_rtt = latest_rtt.max(Duration::from_micros(1));

        if self.first_rtt_sample.is_none() {
            self.first_rtt_sample = Some(now);
            self.min_rtt = self.latest_rtt;
            self.smoothed_rtt = self.latest_rtt;
            self.rttvar = self.latest_rtt / 2;
            return;
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.2
        //# min_rtt MUST be set to the lesser of min_rtt and latest_rtt ...
        //# on all other samples.
        self.min_rtt = self.min_rtt.min(self.latest_rtt);

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
        //# ...MUST apply to the handshake confirmed check before applying
        //# max_ack_delay as the limit.
        let mut ack_delay = ack_delay;
        if is_handshake_confirmed {
            ack_delay = ack_delay.min(self.max_ack_delay);
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
        //# adjusted_rtt = latest_rtt
        //# if (latest_rtt >= min_rtt + ack_delay):
        //#   adjusted_rtt = latest_rtt - ack_delay
        let mut adjusted_rtt = self.latest_rtt;
        if self.latest_rtt >= self.min_rtt + ack_delay {
            adjusted_rtt -= ack_delay;
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
        //# smoothed_rtt = 7/8 * smoothed_rtt + 1/8 * adjusted_rtt
        //# rttvar_sample = abs(smoothed_rtt - adjusted_rtt)
        //# rttvar = 3/4 * rttvar + 1/4 * rttvar_sample
        let rttvar_sample = if self.smoothed_rtt > adjusted_rtt {
            self.smoothed_rtt - adjusted_rtt
        } else {
            adjusted_rtt - self.smoothed_rtt
        };
        self.rttvar = self.rttvar * 3 / 4 + rttvar_sample / 4;
        self.smoothed_rtt = self.smoothed_rtt * 7 / 8 + adjusted_rtt / 8;
    }

    /// The probe-timeout period, before exponential backoff
    ///
    //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.1
    //# PTO = smoothed_rtt + max(4*rttvar, kGranularity) + max_ack_delay
    pub fn pto_period(&self, pto_backoff: u32, space: PacketNumberSpace) -> Duration {
        let mut period = self.smoothed_rtt + (self.rttvar * 4).max(K_GRANULARITY);

        // the application space waits out the peer's ack delay as well
        if space == PacketNumberSpace::Application {
            period += self.max_ack_delay;
        }

        period * pto_backoff
    }

    /// The send-time gap beyond which a span of lost packets indicates
    /// persistent congestion
    pub fn persistent_congestion_threshold(&self) -> Duration {
        (self.smoothed_rtt + (self.rttvar * 4).max(K_GRANULARITY) + self.max_ack_delay)
            * PERSISTENT_CONGESTION_THRESHOLD
    }

    /// How long after a later packet's acknowledgment an earlier packet is
    /// declared lost
    pub fn loss_time_threshold(&self) -> Duration {
        time_reorder_threshold(self.smoothed_rtt).max(K_GRANULARITY)
    }

    /// Resets the estimators after persistent congestion
    ///
    //= https://www.rfc-editor.org/rfc/rfc9002#section-5.2
    //# Endpoints SHOULD set the min_rtt to the newest RTT sample after
    //# persistent congestion is established.
    pub fn on_persistent_congestion(&mut self) {
        self.min_rtt = self.latest_rtt;
        self.smoothed_rtt = self.latest_rtt;
        self.rttvar = self.latest_rtt / 2;
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_RTT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{Clock, NoopClock};

    #[test]
    fn first_sample_seeds_everything() {
        let now = NoopClock.get_time();
        let mut estimator = RttEstimator::default();

        estimator.update_rtt(Duration::from_millis(50), Duration::ZERO, now, false);
        assert_eq!(estimator.min_rtt(), Duration::from_millis(50));
        assert_eq!(estimator.smoothed_rtt(), Duration::from_millis(50));
        assert_eq!(estimator.rttvar(), Duration::from_millis(25));
        assert!(estimator.first_rtt_sample().is_some());
    }

    #[test]
    fn ack_delay_is_subtracted() {
        let now = NoopClock.get_time();
        let mut estimator = RttEstimator::default();

        estimator.update_rtt(Duration::from_millis(50), Duration::ZERO, now, false);
        estimator.update_rtt(
            Duration::from_millis(100),
            Duration::from_millis(30),
            now,
            false,
        );

        // adjusted = 70ms; smoothed = 50*7/8 + 70/8 = 52.5ms
        assert_eq!(estimator.smoothed_rtt(), Duration::from_micros(52_500));
        assert_eq!(estimator.min_rtt(), Duration::from_millis(50));
    }

    #[test]
    fn max_ack_delay_caps_after_confirmation() {
        let now = NoopClock.get_time();
        let mut estimator = RttEstimator::default();
        estimator.on_max_ack_delay(Duration::from_millis(10));

        estimator.update_rtt(Duration::from_millis(50), Duration::ZERO, now, true);
        estimator.update_rtt(
            Duration::from_millis(100),
            Duration::from_millis(30),
            now,
            true,
        );

        // ack delay is clamped to 10ms; adjusted = 90ms
        assert_eq!(estimator.smoothed_rtt(), Duration::from_micros(55_000));
    }

    #[test]
    fn pto_includes_max_ack_delay_only_for_application() {
        let now = NoopClock.get_time();
        let mut estimator = RttEstimator::default();
        estimator.on_max_ack_delay(Duration::from_millis(25));
        estimator.update_rtt(Duration::from_millis(40), Duration::ZERO, now, true);

        let handshake = estimator.pto_period(1, PacketNumberSpace::Handshake);
        let application = estimator.pto_period(1, PacketNumberSpace::Application);
        assert_eq!(application - handshake, Duration::from_millis(25));

        // backoff multiplies the whole period
        assert_eq!(
            estimator.pto_period(4, PacketNumberSpace::Handshake),
            handshake * 4
        );
    }
}
