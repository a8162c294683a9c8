//! The bulk codec: parses and emits the packed wire layout shared by every
//! batch operation.
//!
//! Every batch RPC carries a single logical payload laid out as one or more
//! size vectors followed by the packed data those sizes describe. This
//! module only deals in already-pulled byte slices; RDMA pull/push of the
//! bytes themselves is [`crate::transport`]'s job.

use std::convert::TryInto;

use crate::error::{Error, Result};
use crate::sentinel::{Sentinel, LAST_VALID_SIZE};

const SIZE_WIDTH: usize = std::mem::size_of::<u64>();

/// Reads `count` little-endian `u64` size entries from the front of `buf`.
/// Returns the sizes and the number of bytes consumed.
pub fn decode_sizes(buf: &[u8], count: usize) -> Result<(Vec<u64>, usize)> {
    let needed = count
        .checked_mul(SIZE_WIDTH)
        .ok_or_else(|| Error::InvalidArgs("size vector overflow".into()))?;
    if buf.len() < needed {
        return Err(Error::InvalidArgs("bulk payload too small for size vector".into()));
    }
    let mut sizes = Vec::with_capacity(count);
    for i in 0..count {
        let start = i * SIZE_WIDTH;
        let bytes: [u8; SIZE_WIDTH] = buf[start..start + SIZE_WIDTH]
            .try_into()
            .expect("slice is exactly SIZE_WIDTH bytes");
        sizes.push(u64::from_le_bytes(bytes));
    }
    Ok((sizes, needed))
}

/// Encodes a vector of sizes as little-endian `u64`s.
pub fn encode_sizes(sizes: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(sizes.len() * SIZE_WIDTH);
    for &s in sizes {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Splits `buf` into slices of the lengths named by `sizes`, all of which
/// must be real lengths (not sentinels). Fails with [`Error::InvalidArgs`]
/// if `buf` is shorter than the sum of `sizes`.
pub fn split_packed<'a>(buf: &'a [u8], sizes: &[u64]) -> Result<Vec<&'a [u8]>> {
    let mut out = Vec::with_capacity(sizes.len());
    let mut offset = 0usize;
    for &size in sizes {
        if size > LAST_VALID_SIZE {
            return Err(Error::InvalidArgs("size vector entry is a sentinel, not a length".into()));
        }
        let size = size as usize;
        let end = offset
            .checked_add(size)
            .ok_or_else(|| Error::InvalidArgs("packed buffer overflow".into()))?;
        if end > buf.len() {
            return Err(Error::InvalidArgs("packed buffer shorter than advertised sizes".into()));
        }
        out.push(&buf[offset..end]);
        offset = end;
    }
    Ok(out)
}

/// Concatenates `entries` back-to-back, the inverse of `split_packed`.
pub fn pack_entries(entries: &[&[u8]]) -> Vec<u8> {
    let total: usize = entries.iter().map(|e| e.len()).sum();
    let mut out = Vec::with_capacity(total);
    for e in entries {
        out.extend_from_slice(e);
    }
    out
}

/// Decodes the `put_bulk` layout:
/// `[ksizes][vsizes][keys packed][values packed]`.
pub fn decode_put<'a>(buf: &'a [u8], count: usize) -> Result<(Vec<&'a [u8]>, Vec<&'a [u8]>)> {
    let (ksizes, consumed) = decode_sizes(buf, count)?;
    let buf = &buf[consumed..];
    let (vsizes, consumed) = decode_sizes(buf, count)?;
    let buf = &buf[consumed..];

    let keys = split_packed(buf, &ksizes)?;
    let keys_len: usize = ksizes.iter().map(|&s| s as usize).sum();
    let values = split_packed(&buf[keys_len..], &vsizes)?;
    Ok((keys, values))
}

/// Encodes the `put_bulk` layout.
pub fn encode_put(keys: &[&[u8]], values: &[&[u8]]) -> Result<Vec<u8>> {
    if keys.len() != values.len() {
        return Err(Error::InvalidArgs("keys and values count mismatch".into()));
    }
    let ksizes: Vec<u64> = keys.iter().map(|k| k.len() as u64).collect();
    let vsizes: Vec<u64> = values.iter().map(|v| v.len() as u64).collect();

    let mut out = encode_sizes(&ksizes);
    out.extend_from_slice(&encode_sizes(&vsizes));
    out.extend_from_slice(&pack_entries(keys));
    out.extend_from_slice(&pack_entries(values));
    Ok(out)
}

/// Decodes a `[sizes][packed bytes]` layout: one size vector followed by
/// that many back-to-back byte strings. Shared by the key side of
/// `erase_bulk`/`exists_bulk`/`length_bulk`/`get_bulk`'s request and the
/// document store's packed/bulk `store` variants (spec.md §4.1's "doc_*:
/// analogous" note — a packed document list has no per-entry key, just
/// sizes and bodies).
pub fn decode_packed<'a>(buf: &'a [u8], count: usize) -> Result<Vec<&'a [u8]>> {
    let (sizes, consumed) = decode_sizes(buf, count)?;
    split_packed(&buf[consumed..], &sizes)
}

/// Encodes a `[sizes][packed bytes]` layout, the inverse of `decode_packed`.
pub fn encode_packed(items: &[&[u8]]) -> Vec<u8> {
    let sizes: Vec<u64> = items.iter().map(|i| i.len() as u64).collect();
    let mut out = encode_sizes(&sizes);
    out.extend_from_slice(&pack_entries(items));
    out
}

/// Decodes the key side of `erase_bulk`/`exists_bulk`/`length_bulk`/the
/// request half of `get_bulk`: `[ksizes][keys packed]`.
pub fn decode_keys<'a>(buf: &'a [u8], count: usize) -> Result<Vec<&'a [u8]>> {
    decode_packed(buf, count)
}

/// One looked-up value, or the reason it is absent, for the `get_bulk`
/// response encoder.
pub enum Lookup<'a> {
    Found(&'a [u8]),
    NotFound,
}

/// Encodes the `get_bulk` response value region.
///
/// When `packed` is `false`, each value is scattered into a fixed-size slot
/// taken from `vsizes` (the caller-declared input sizes); a value that
/// doesn't fit its slot reports `SIZE_TOO_SMALL` for that item and later
/// items' slots are skipped entirely. When `packed` is `true`, values are
/// written back-to-back up to `vbufsize` total; once the running total
/// would exceed `vbufsize`, that and all following items report
/// `SIZE_TOO_SMALL`.
pub fn encode_get_response(
    lookups: &[Lookup<'_>],
    vsizes_in: &[u64],
    packed: bool,
    vbufsize: usize,
) -> (Vec<u64>, Vec<u8>) {
    let mut out_sizes = Vec::with_capacity(lookups.len());
    let mut data = Vec::new();

    if packed {
        let mut used = 0usize;
        let mut too_small_from_here = false;
        for lookup in lookups {
            match lookup {
                Lookup::NotFound => out_sizes.push(Sentinel::KeyNotFound.encode()),
                Lookup::Found(value) => {
                    if too_small_from_here || used + value.len() > vbufsize {
                        too_small_from_here = true;
                        out_sizes.push(Sentinel::SizeTooSmall.encode());
                    } else {
                        data.extend_from_slice(value);
                        used += value.len();
                        out_sizes.push(value.len() as u64);
                    }
                }
            }
        }
    } else {
        for (i, lookup) in lookups.iter().enumerate() {
            let slot = vsizes_in.get(i).copied().unwrap_or(0) as usize;
            match lookup {
                Lookup::NotFound => out_sizes.push(Sentinel::KeyNotFound.encode()),
                Lookup::Found(value) => {
                    if value.len() > slot {
                        out_sizes.push(Sentinel::SizeTooSmall.encode());
                        data.extend(std::iter::repeat(0u8).take(slot));
                    } else {
                        data.extend_from_slice(value);
                        data.extend(std::iter::repeat(0u8).take(slot - value.len()));
                        out_sizes.push(value.len() as u64);
                    }
                }
            }
        }
    }

    (out_sizes, data)
}

/// Encodes the `exists_bulk` response bitfield: bit `i` (LSB-first within
/// each byte) is 1 iff key `i` is present.
pub fn encode_exists_bitfield(flags: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; (flags.len() + 7) / 8];
    for (i, &present) in flags.iter().enumerate() {
        if present {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

/// Decodes an `exists_bulk` bitfield back into per-item booleans.
pub fn decode_exists_bitfield(buf: &[u8], count: usize) -> Result<Vec<bool>> {
    let needed = (count + 7) / 8;
    if buf.len() < needed {
        return Err(Error::InvalidArgs("exists bitfield too small".into()));
    }
    Ok((0..count).map(|i| (buf[i / 8] >> (i % 8)) & 1 == 1).collect())
}

/// Validates that a batch's advertised `count` and fixed header fit within
/// `buf`, and that `segment_count` (the number of contiguous bulk segments
/// backing a region the codec must read directly) is exactly 1.
pub fn validate_header(buf_len: usize, min_len: usize, segment_count: usize) -> Result<()> {
    if buf_len < min_len {
        return Err(Error::InvalidArgs("bulk payload smaller than the fixed header requires".into()));
    }
    if segment_count != 1 {
        return Err(Error::Noncontig);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_decode_round_trips() {
        let keys: Vec<&[u8]> = vec![b"k1", b"k2", b"k3"];
        let values: Vec<&[u8]> = vec![b"v1", b"", b"v3longer"];
        let encoded = encode_put(&keys, &values).unwrap();
        let (dkeys, dvalues) = decode_put(&encoded, 3).unwrap();
        assert_eq!(dkeys, keys);
        assert_eq!(dvalues, values);
    }

    #[test]
    fn exists_bitfield_round_trips_lsb_first() {
        let flags = vec![true, false, true, true, false, false, false, false, true];
        let bits = encode_exists_bitfield(&flags);
        assert_eq!(bits.len(), 2);
        assert_eq!(bits[0], 0b0000_1101);
        let decoded = decode_exists_bitfield(&bits, flags.len()).unwrap();
        assert_eq!(decoded, flags);
    }

    #[test]
    fn packed_get_reports_size_too_small_for_remaining_items() {
        let lookups = vec![Lookup::Found(b"abc"), Lookup::Found(b"defgh"), Lookup::Found(b"x")];
        let (sizes, data) = encode_get_response(&lookups, &[], true, 4);
        assert_eq!(sizes[0], 3);
        assert_eq!(sizes[1], Sentinel::SizeTooSmall.encode());
        assert_eq!(sizes[2], Sentinel::SizeTooSmall.encode());
        assert_eq!(data, b"abc");
    }

    #[test]
    fn missing_key_reports_key_not_found_sentinel() {
        let lookups = vec![Lookup::NotFound];
        let (sizes, data) = encode_get_response(&lookups, &[], true, 16);
        assert_eq!(sizes[0], Sentinel::KeyNotFound.encode());
        assert!(data.is_empty());
    }

    #[test]
    fn noncontig_segment_count_is_rejected() {
        assert!(matches!(validate_header(100, 8, 2), Err(Error::Noncontig)));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn put_round_trips_for_arbitrary_keys_and_values(
            entries in prop::collection::vec((prop::collection::vec(any::<u8>(), 0..16), prop::collection::vec(any::<u8>(), 0..16)), 0..8)
        ) {
            let keys: Vec<&[u8]> = entries.iter().map(|(k, _)| k.as_slice()).collect();
            let values: Vec<&[u8]> = entries.iter().map(|(_, v)| v.as_slice()).collect();
            let encoded = encode_put(&keys, &values).unwrap();
            let (dkeys, dvalues) = decode_put(&encoded, entries.len()).unwrap();
            prop_assert_eq!(dkeys, keys);
            prop_assert_eq!(dvalues, values);
        }

        #[test]
        fn packed_round_trips_for_arbitrary_items(
            items in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..16), 0..8)
        ) {
            let refs: Vec<&[u8]> = items.iter().map(|i| i.as_slice()).collect();
            let encoded = encode_packed(&refs);
            let decoded = decode_packed(&encoded, items.len()).unwrap();
            prop_assert_eq!(decoded, refs);
        }

        #[test]
        fn exists_bitfield_round_trips_for_arbitrary_flags(
            flags in prop::collection::vec(any::<bool>(), 0..64)
        ) {
            let bits = encode_exists_bitfield(&flags);
            let decoded = decode_exists_bitfield(&bits, flags.len()).unwrap();
            prop_assert_eq!(decoded, flags);
        }
    }
}
