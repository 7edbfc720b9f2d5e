// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use bolero::check;
use s2n_codec::{DecoderBuffer, EncoderBuffer};

fn round_trip(value: VarInt) -> (usize, VarInt) {
    let mut buffer = [0u8; 8];
    let len = {
        let mut encoder = EncoderBuffer::new(&mut buffer);
        encoder.encode(&value);
        encoder.len()
    };
    let (decoded, remaining) = DecoderBuffer::new(&buffer[..len])
        .decode::<VarInt>()
        .unwrap();
    assert!(remaining.is_empty());
    (len, decoded)
}

#[test]
#[cfg_attr(miri, ignore)] // too expensive for miri
fn round_trip_values_test() {
    check!().with_type().cloned().for_each(|value: u64| {
        if let Ok(value) = VarInt::new(value) {
            let (len, decoded) = round_trip(value);
            assert_eq!(decoded, value);
            assert_eq!(len, value.encoding_size());
        } else {
            assert!(value > MAX_VARINT_VALUE);
        }
    })
}

#[test]
fn canonical_length_boundaries() {
    for (value, expected) in [
        (0u64, 1),
        (63, 1),
        (64, 2),
        (16_383, 2),
        (16_384, 4),
        (1_073_741_823, 4),
        (1_073_741_824, 8),
        (MAX_VARINT_VALUE, 8),
    ] {
        let value = VarInt::new(value).unwrap();
        let (len, decoded) = round_trip(value);
        assert_eq!(len, expected, "wrong length for {value}");
        assert_eq!(decoded, value);
    }
}

//= https://www.rfc-editor.org/rfc/rfc9000#appendix-A.1
//# For example, the eight-byte sequence 0xc2197c5eff14e88c decodes to
//# the decimal value 151,288,809,941,952,652; the four-byte sequence
//# 0x9d7f3e7d decodes to 494,878,333; the two-byte sequence 0x7bbd
//# decodes to 15,293; and the single byte 0x25 decodes to 37 (as does
//# the two-byte sequence 0x4025).

macro_rules! sequence_test {
    ($name:ident($input:expr, $expected:expr)) => {
        #[test]
        fn $name() {
            let input = $input;
            let expected = VarInt::new($expected).unwrap();

            let (decoded, _) = DecoderBuffer::new(&input[..]).decode::<VarInt>().unwrap();
            assert_eq!(decoded, expected);

            let mut buffer = [0u8; 8];
            let mut encoder = EncoderBuffer::new(&mut buffer);
            encoder.encode(&expected);
            let len = encoder.len();
            assert_eq!(&buffer[..len], &input[..]);
        }
    };
}

sequence_test!(eight_byte_sequence_example(
    [0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c],
    151_288_809_941_952_652
));

sequence_test!(four_byte_sequence_example(
    [0x9d, 0x7f, 0x3e, 0x7d],
    494_878_333
));

sequence_test!(two_byte_sequence_example([0x7b, 0xbd], 15293));

sequence_test!(one_byte_sequence_example([0x25], 37));

#[test]
fn non_canonical_decodes() {
    // 0x4025 also decodes to 37 but re-encodes to a single byte
    let (decoded, _) = DecoderBuffer::new(&[0x40, 0x25][..])
        .decode::<VarInt>()
        .unwrap();
    assert_eq!(decoded, VarInt::from_u8(37));
    assert_eq!(decoded.encoding_size(), 1);
}
