//! Property-based tests for BER and KLV round-trips.

use proptest::prelude::*;

use mxfkit_core::{
    ber_length_size, read_ber_slice, write_ber, Klv, KlvReader, UniversalLabel,
};

proptest! {
    /// Shortest-form encoding reads back to the same value.
    #[test]
    fn roundtrip_ber_shortest(value in any::<u64>()) {
        let mut buf = Vec::new();
        let written = write_ber(&mut buf, value, 0).unwrap();

        let (decoded, consumed) = read_ber_slice(&buf).unwrap();
        prop_assert_eq!(decoded, value);
        prop_assert_eq!(consumed, written);
        prop_assert_eq!(written, ber_length_size(value, 0));
    }

    /// Shortest-form output is minimal: no shorter valid form exists.
    #[test]
    fn shortest_form_is_minimal(value in any::<u64>()) {
        let size = ber_length_size(value, 0);
        if value < 0x80 {
            prop_assert_eq!(size, 1);
        } else {
            // The long form floor is 0x83 plus three payload bytes
            prop_assert!(size >= 4);
            if size > 4 {
                // One payload byte fewer would truncate the value
                let payload = size - 1;
                prop_assert!(value >> ((payload - 1) * 8) != 0);
            }
        }
    }

    /// Fixed-size encodings hold any value that fits the payload width.
    #[test]
    fn roundtrip_ber_fixed(value in any::<u64>(), extra in 0usize..=3) {
        let mut minimal = 1;
        while minimal < 8 && (value >> (minimal * 8)) != 0 {
            minimal += 1;
        }
        let payload = (minimal + extra).min(8);

        let mut buf = Vec::new();
        let written = write_ber(&mut buf, value, payload + 1).unwrap();
        prop_assert_eq!(written, payload + 1);

        let (decoded, consumed) = read_ber_slice(&buf).unwrap();
        prop_assert_eq!(decoded, value);
        prop_assert_eq!(consumed, written);
    }

    /// A written KLV parses back bit-exact.
    #[test]
    fn roundtrip_klv(key in any::<[u8; 16]>(), value in proptest::collection::vec(any::<u8>(), 0..512)) {
        let klv = Klv::new(key, value.clone());

        let mut buf = Vec::new();
        let written = klv.write(&mut buf).unwrap();
        prop_assert_eq!(written, buf.len());
        prop_assert_eq!(written, klv.total_size());

        let mut reader = KlvReader::new(&buf);
        let parsed = reader.read_klv().unwrap().unwrap();
        prop_assert_eq!(parsed.key, UniversalLabel(key));
        prop_assert_eq!(parsed.value, value);
        prop_assert!(reader.read_klv().unwrap().is_none());
    }
}
