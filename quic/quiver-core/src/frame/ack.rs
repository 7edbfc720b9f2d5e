// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{frame::Tag, varint::VarInt};
use core::ops::RangeInclusive;
use s2n_codec::{
    decoder_parameterized_value, decoder_value, DecoderBuffer, DecoderError, Encoder, EncoderValue,
};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.3
//# Receivers send ACK frames (types 0x02 and 0x03) to inform senders of
//# packets they have received and processed.

const ACK_TAG: Tag = 0x02;
const ACK_W_ECN_TAG: Tag = 0x03;

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.3
//# ACK Frame {
//#   Type (i) = 0x02..0x03,
//#   Largest Acknowledged (i),
//#   ACK Delay (i),
//#   ACK Range Count (i),
//#   First ACK Range (i),
//#   ACK Range (..) ...,
//#   [ECN Counts (..)],
//# }

#[derive(Clone, PartialEq, Eq)]
pub struct Ack<A> {
    /// Time delta in microseconds (scaled by the peer's ack_delay_exponent)
    /// between receipt of the largest acknowledged packet and this ACK
    pub ack_delay: VarInt,

    /// Acknowledged packet-number ranges, descending
    pub ack_ranges: A,

    /// ECN counts, present only for type 0x03
    pub ecn_counts: Option<EcnCounts>,
}

impl<A> Ack<A> {
    #[inline]
    pub fn tag(&self) -> Tag {
        if self.ecn_counts.is_some() {
            ACK_W_ECN_TAG
        } else {
            ACK_TAG
        }
    }
}

impl<A: AckRanges> Ack<A> {
    #[inline]
    pub fn ack_ranges(&self) -> A::Iter {
        self.ack_ranges.ack_ranges()
    }

    #[inline]
    pub fn largest_acknowledged(&self) -> VarInt {
        self.ack_ranges.largest_acknowledged()
    }
}

impl<A: core::fmt::Debug> core::fmt::Debug for Ack<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Ack")
            .field("ack_delay", &self.ack_delay)
            .field("ack_ranges", &self.ack_ranges)
            .field("ecn_counts", &self.ecn_counts)
            .finish()
    }
}

decoder_parameterized_value!(
    impl<'a> Ack<AckRangesDecoder<'a>> {
        fn decode(tag: Tag, buffer: Buffer) -> Result<Self> {
            let (largest_acknowledged, buffer) = buffer.decode()?;
            let (ack_delay, buffer) = buffer.decode()?;
            let (ack_ranges, buffer) = buffer.decode_parameterized(largest_acknowledged)?;

            let (ecn_counts, buffer) = if tag == ACK_W_ECN_TAG {
                let (ecn_counts, buffer) = buffer.decode()?;
                (Some(ecn_counts), buffer)
            } else {
                (None, buffer)
            };

            let frame = Ack {
                ack_delay,
                ack_ranges,
                ecn_counts,
            };

            Ok((frame, buffer))
        }
    }
);

impl<A: AckRanges> EncoderValue for Ack<A> {
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.tag());

        let mut iter = self.ack_ranges.ack_ranges();

        let first_ack_range = iter.next().expect("at least one ack range is required");
        let (mut smallest, largest_acknowledged) = first_ack_range.into_inner();
        let first_ack_range = largest_acknowledged - smallest;

        let ack_range_count =
            VarInt::try_from(iter.len()).expect("ack range count cannot exceed VarInt::MAX");

        buffer.encode(&largest_acknowledged);
        buffer.encode(&self.ack_delay);
        buffer.encode(&ack_range_count);
        buffer.encode(&first_ack_range);

        for range in iter {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.3.1
            //# largest = previous_smallest - gap - 2
            let (start, end) = range.into_inner();
            let gap = smallest - end - 2;
            let ack_range = end - start;

            buffer.encode(&gap);
            buffer.encode(&ack_range);
            smallest = start;
        }

        if let Some(ecn_counts) = self.ecn_counts.as_ref() {
            buffer.encode(ecn_counts);
        }
    }
}

/// Acknowledged packet-number ranges, iterated descending (largest first)
pub trait AckRanges {
    type Iter: Iterator<Item = RangeInclusive<VarInt>> + ExactSizeIterator;

    fn ack_ranges(&self) -> Self::Iter;

    fn largest_acknowledged(&self) -> VarInt {
        *self
            .ack_ranges()
            .next()
            .expect("at least one ack range is required")
            .end()
    }
}

/// Lazily-decoded ACK ranges borrowing the frame payload.
///
/// The whole range list is validated once at decode time; iteration
/// afterwards cannot fail.
#[derive(Clone, Copy)]
pub struct AckRangesDecoder<'a> {
    largest_acknowledged: VarInt,
    ack_range_count: VarInt,
    range_buffer: DecoderBuffer<'a>,
}

impl<'a> AckRanges for AckRangesDecoder<'a> {
    type Iter = AckRangesIter<'a>;

    #[inline]
    fn ack_ranges(&self) -> Self::Iter {
        AckRangesIter {
            largest_acknowledged: self.largest_acknowledged,
            ack_range_count: self.ack_range_count,
            range_buffer: self.range_buffer,
        }
    }

    #[inline]
    fn largest_acknowledged(&self) -> VarInt {
        self.largest_acknowledged
    }
}

impl<'a> PartialEq for AckRangesDecoder<'a> {
    fn eq(&self, other: &Self) -> bool {
        self.ack_ranges().eq(other.ack_ranges())
    }
}

impl<'a> Eq for AckRangesDecoder<'a> {}

impl<'a> core::fmt::Debug for AckRangesDecoder<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_list().entries(self.ack_ranges()).finish()
    }
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.3.1
//# If any computed packet number is negative, an endpoint MUST generate
//# a connection error of type FRAME_ENCODING_ERROR.

const ACK_RANGE_DECODING_ERROR: DecoderError =
    DecoderError::InvariantViolation("invalid ACK ranges");

decoder_parameterized_value!(
    impl<'a> AckRangesDecoder<'a> {
        fn decode(largest_acknowledged: VarInt, buffer: Buffer) -> Result<AckRangesDecoder> {
            let (mut ack_range_count, buffer) = buffer.decode::<VarInt>()?;

            // add one to the total, which includes the first ack range
            ack_range_count = ack_range_count
                .checked_add(VarInt::from_u8(1))
                .ok_or(ACK_RANGE_DECODING_ERROR)?;

            let mut iter = AckRangesIter {
                ack_range_count,
                range_buffer: buffer.peek(),
                largest_acknowledged,
            };

            // make sure we can decode all of the range/gap pairs
            for _ in 0..*ack_range_count {
                iter.next().ok_or(ACK_RANGE_DECODING_ERROR)?;
            }

            let peek_len = iter.range_buffer.len();
            let buffer_len = buffer.len();
            debug_assert!(buffer_len >= peek_len);
            let (range_buffer, remaining) = buffer.decode_slice(buffer_len - peek_len)?;

            let ack_ranges = AckRangesDecoder {
                largest_acknowledged,
                ack_range_count,
                range_buffer: range_buffer.into(),
            };

            Ok((ack_ranges, remaining))
        }
    }
);

#[derive(Clone, Copy)]
pub struct AckRangesIter<'a> {
    largest_acknowledged: VarInt,
    ack_range_count: VarInt,
    range_buffer: DecoderBuffer<'a>,
}

impl<'a> Iterator for AckRangesIter<'a> {
    type Item = RangeInclusive<VarInt>;

    fn next(&mut self) -> Option<Self::Item> {
        self.ack_range_count = self.ack_range_count.checked_sub(VarInt::from_u8(1))?;

        let largest_acknowledged = self.largest_acknowledged;
        let (ack_range, buffer) = self.range_buffer.decode::<VarInt>().ok()?;

        let start = largest_acknowledged.checked_sub(ack_range)?;
        let end = largest_acknowledged;

        // if we're not on the last range, decode the next gap
        self.range_buffer = if self.ack_range_count != VarInt::ZERO {
            let (gap, buffer) = buffer.decode::<VarInt>().ok()?;
            self.largest_acknowledged = start
                .checked_sub(gap)?
                .checked_sub(VarInt::from_u8(2))?;
            buffer
        } else {
            buffer
        };

        Some(start..=end)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let ack_range_count = *self.ack_range_count as usize;
        (ack_range_count, Some(ack_range_count))
    }
}

impl<'a> ExactSizeIterator for AckRangesIter<'a> {}

impl<'a> core::fmt::Debug for AckRangesIter<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_list().entries(*self).finish()
    }
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.3.2
//# ECN Counts {
//#   ECT0 Count (i),
//#   ECT1 Count (i),
//#   ECN-CE Count (i),
//# }

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EcnCounts {
    pub ect_0_count: VarInt,
    pub ect_1_count: VarInt,
    pub ce_count: VarInt,
}

decoder_value!(
    impl<'a> EcnCounts {
        fn decode(buffer: Buffer) -> Result<Self> {
            let (ect_0_count, buffer) = buffer.decode()?;
            let (ect_1_count, buffer) = buffer.decode()?;
            let (ce_count, buffer) = buffer.decode()?;

            let ecn_counts = EcnCounts {
                ect_0_count,
                ect_1_count,
                ce_count,
            };

            Ok((ecn_counts, buffer))
        }
    }
);

impl EncoderValue for EcnCounts {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.ect_0_count);
        buffer.encode(&self.ect_1_count);
        buffer.encode(&self.ce_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use s2n_codec::EncoderBuffer;

    /// Ranges held in a Vec, descending; used by tests and the ack tracker
    impl AckRanges for Vec<RangeInclusive<VarInt>> {
        type Iter = alloc::vec::IntoIter<RangeInclusive<VarInt>>;

        fn ack_ranges(&self) -> Self::Iter {
            self.clone().into_iter()
        }
    }

    fn round_trip(ranges: Vec<RangeInclusive<VarInt>>, ecn_counts: Option<EcnCounts>) {
        let frame = Ack {
            ack_delay: VarInt::from_u8(42),
            ack_ranges: ranges.clone(),
            ecn_counts,
        };

        let mut bytes = [0u8; 1500];
        let len = {
            let mut encoder = EncoderBuffer::new(&mut bytes);
            encoder.encode(&frame);
            encoder.len()
        };

        let (decoded, remaining) = crate::frame::Frame::decode(DecoderBuffer::new(&bytes[..len]))
            .expect("decodable frame");
        assert!(remaining.is_empty());

        match decoded {
            crate::frame::Frame::Ack(decoded) => {
                assert_eq!(decoded.ack_delay, frame.ack_delay);
                assert_eq!(decoded.ecn_counts, frame.ecn_counts);
                assert!(decoded.ack_ranges().eq(ranges.into_iter()));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    fn ranges(input: &[(u64, u64)]) -> Vec<RangeInclusive<VarInt>> {
        input
            .iter()
            .map(|(start, end)| {
                VarInt::new(*start).unwrap()..=VarInt::new(*end).unwrap()
            })
            .collect()
    }

    #[test]
    fn single_range() {
        round_trip(ranges(&[(0, 0)]), None);
        round_trip(ranges(&[(3, 7)]), None);
    }

    #[test]
    fn multiple_ranges_descending() {
        round_trip(ranges(&[(20, 25), (10, 15), (0, 3)]), None);
    }

    #[test]
    fn with_ecn_counts() {
        round_trip(
            ranges(&[(9, 9), (2, 5)]),
            Some(EcnCounts {
                ect_0_count: VarInt::from_u8(1),
                ect_1_count: VarInt::from_u8(2),
                ce_count: VarInt::from_u8(3),
            }),
        );
    }

    #[test]
    fn negative_packet_number_rejected() {
        // largest=1, delay=0, range_count=1, first_range=0, gap=63 underflows
        let bytes = [0x02u8, 0x01, 0x00, 0x01, 0x00, 0x3f, 0x00];
        assert!(crate::frame::Frame::decode(DecoderBuffer::new(&bytes)).is_err());
    }
}
