//! Sentinel size encoding.
//!
//! The 64-bit size field carried alongside every key/value/document in a
//! bulk payload doubles as a per-item status channel: any value above
//! [`LAST_VALID_SIZE`] is not a length but one of the constants below.

/// The largest size value that represents a real length. Anything greater
/// is a sentinel.
pub const LAST_VALID_SIZE: u64 = u64::MAX - 4;

/// The requested key has no value in the database.
pub const KEY_NOT_FOUND: u64 = u64::MAX - 3;

/// The destination buffer for this item was smaller than the value.
pub const SIZE_TOO_SMALL: u64 = u64::MAX - 2;

/// A listing/iteration ran out of keys before filling the requested count.
pub const NO_MORE_KEYS: u64 = u64::MAX - 1;

/// A document listing/iteration ran out of documents before filling the
/// requested count.
pub const NO_MORE_DOCS: u64 = u64::MAX;

/// The decoded meaning of a wire size value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    /// A real length in bytes.
    Size(u64),
    KeyNotFound,
    SizeTooSmall,
    NoMoreKeys,
    NoMoreDocs,
}

impl Sentinel {
    /// Classifies a raw wire size value.
    pub fn decode(raw: u64) -> Self {
        match raw {
            KEY_NOT_FOUND => Sentinel::KeyNotFound,
            SIZE_TOO_SMALL => Sentinel::SizeTooSmall,
            NO_MORE_KEYS => Sentinel::NoMoreKeys,
            NO_MORE_DOCS => Sentinel::NoMoreDocs,
            size => Sentinel::Size(size),
        }
    }

    /// Encodes this sentinel back into its raw wire value.
    pub fn encode(self) -> u64 {
        match self {
            Sentinel::Size(size) => {
                debug_assert!(size <= LAST_VALID_SIZE, "size collides with a sentinel value");
                size
            }
            Sentinel::KeyNotFound => KEY_NOT_FOUND,
            Sentinel::SizeTooSmall => SIZE_TOO_SMALL,
            Sentinel::NoMoreKeys => NO_MORE_KEYS,
            Sentinel::NoMoreDocs => NO_MORE_DOCS,
        }
    }

    pub fn is_size(self) -> bool {
        matches!(self, Sentinel::Size(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_real_sizes() {
        for size in [0u64, 1, 42, LAST_VALID_SIZE] {
            assert_eq!(Sentinel::decode(size), Sentinel::Size(size));
            assert_eq!(Sentinel::Size(size).encode(), size);
        }
    }

    #[test]
    fn sentinels_are_distinct_and_above_last_valid_size() {
        let sentinels = [KEY_NOT_FOUND, SIZE_TOO_SMALL, NO_MORE_KEYS, NO_MORE_DOCS];
        for &s in &sentinels {
            assert!(s > LAST_VALID_SIZE);
        }
        let mut sorted = sentinels.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), sentinels.len());
    }

    #[test]
    fn no_more_docs_and_no_more_keys_are_distinct() {
        assert_ne!(Sentinel::decode(NO_MORE_DOCS), Sentinel::decode(NO_MORE_KEYS));
    }
}
