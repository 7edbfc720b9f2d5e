// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//= https://www.rfc-editor.org/rfc/rfc9002#section-2
//# Ack-eliciting frames:  All frames other than ACK, PADDING, and
//#    CONNECTION_CLOSE are considered ack-eliciting.

/// Whether a frame (or a packet, as the max over its frames) requires the
/// receiver to send an acknowledgment
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum AckElicitation {
    #[default]
    NonEliciting,
    Eliciting,
}

impl AckElicitation {
    #[inline]
    pub fn is_ack_eliciting(self) -> bool {
        matches!(self, Self::Eliciting)
    }

    /// Merges in the elicitation of another frame
    #[inline]
    pub fn merge(&mut self, other: Self) {
        *self = (*self).max(other);
    }
}
