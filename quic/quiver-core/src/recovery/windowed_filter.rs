// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Three-sample max-over-window estimator.
//!
//! Based on the windowed min/max tracker from the Linux kernel's TCP BBR
//! (lib/minmax.c): alongside the best sample, second- and third-best
//! candidates are staged so the estimate can step down smoothly as the best
//! sample ages out of the window.

/// Tracks the maximum sample seen over a sliding window.
///
/// Time is any monotonically-increasing `u64` (the BBR users feed it the
/// round-trip counter).
#[derive(Clone, Copy, Debug, Default)]
pub struct WindowedFilter {
    window_length: u64,
    estimates: [Option<(u64, u64)>; 3],
}

impl WindowedFilter {
    pub fn new(window_length: u64) -> Self {
        Self {
            window_length,
            estimates: [None; 3],
        }
    }

    /// The current best (largest) sample, if any
    #[inline]
    pub fn best(&self) -> u64 {
        self.estimates[0].map(|(sample, _)| sample).unwrap_or(0)
    }

    /// Forgets history and seeds all three estimates with `sample`
    #[inline]
    pub fn reset(&mut self, sample: u64, time: u64) {
        self.estimates = [Some((sample, time)); 3];
    }

    /// Folds a new sample into the filter
    pub fn update(&mut self, sample: u64, time: u64) {
        let (best, oldest_time) = match (self.estimates[0], self.estimates[2]) {
            (Some((best, _)), Some((_, time))) => (best, time),
            _ => {
                self.reset(sample, time);
                return;
            }
        };

        // a new best, or a window with no samples at all, resets everything
        if sample >= best || time - oldest_time > self.window_length {
            self.reset(sample, time);
            return;
        }

        // bubble the sample into the candidate slots
        if sample >= self.estimates[1].expect("populated above").0 {
            self.estimates[1] = Some((sample, time));
            self.estimates[2] = self.estimates[1];
        } else if sample >= self.estimates[2].expect("populated above").0 {
            self.estimates[2] = Some((sample, time));
        }

        // age the best estimate out of the window
        if time - self.estimates[0].expect("populated above").1 > self.window_length {
            self.estimates[0] = self.estimates[1];
            self.estimates[1] = self.estimates[2];
            self.estimates[2] = Some((sample, time));

            if time - self.estimates[0].expect("shifted").1 > self.window_length {
                self.estimates[0] = self.estimates[1];
                self.estimates[1] = self.estimates[2];
            }
            return;
        }

        // refresh stale candidates so the filter can keep stepping down
        let (best, _) = self.estimates[0].expect("populated above");
        let (second, second_time) = self.estimates[1].expect("populated above");

        if second == best && time - second_time > (self.window_length >> 2) {
            self.estimates[1] = Some((sample, time));
            self.estimates[2] = Some((sample, time));
            return;
        }

        let (third, third_time) = self.estimates[2].expect("populated above");
        if third == second && time - third_time > (self.window_length >> 1) {
            self.estimates[2] = Some((sample, time));
        }
    }
}
