//! The per-operation `mode` bitmask.

use std::ops::{BitAnd, BitAndAssign, BitOrAssign, Not};

/// A generic bitmask wrapper providing named bit accessors.
#[derive(Debug)]
pub(crate) struct BitMask<T>(T);

impl<T> BitMask<T>
where
    T: BitAnd<Output = T> + BitAndAssign + BitOrAssign + Default + Not<Output = T> + Copy + PartialEq,
{
    pub(crate) fn new() -> Self {
        Self(T::default())
    }

    pub(crate) fn from(val: T) -> Self {
        Self(val)
    }

    pub(crate) fn bit_mask(&self) -> T {
        self.0
    }

    pub(crate) fn set_bit_value(&mut self, f: T, v: bool) {
        match v {
            true => self.set(f),
            false => self.reset(f),
        }
    }

    pub(crate) fn get_bit_value(&self, f: T) -> bool {
        (self.0 & f) != T::default()
    }

    fn set(&mut self, f: T) {
        self.0 |= f;
    }

    fn reset(&mut self, f: T) {
        self.0 &= !f;
    }
}

pub(crate) type BitMask32 = BitMask<u32>;

/// Generates a pair of `is_x`/`set_x` accessors over a `BitMask32` field,
/// plus the underlying flag constant.
macro_rules! mode_flag {
    ($const_name:ident = $bit:expr, $is_name:ident, $set_name:ident, $doc:expr) => {
        #[doc = $doc]
        pub const $const_name: u32 = $bit;

        #[doc = $doc]
        pub fn $is_name(&self) -> bool {
            self.bits.get_bit_value(Self::$const_name)
        }

        #[doc = $doc]
        pub fn $set_name(&mut self, v: bool) -> &mut Self {
            self.bits.set_bit_value(Self::$const_name, v);
            self
        }
    };
}

/// The 32-bit policy bitmask carried on every operation.
///
/// Backends must reject requests carrying unknown bits (see
/// [`Mode::from_raw`]).
#[derive(Debug)]
pub struct Mode {
    bits: BitMask32,
}

impl Mode {
    /// No flags set.
    pub const DEFAULT: u32 = 0;

    mode_flag!(INCLUSIVE = 1 << 0, is_inclusive, set_inclusive, "Includes `from_key` in a range scan.");
    mode_flag!(APPEND = 1 << 1, is_append, set_append, "Makes `put` append to the existing value.");
    mode_flag!(CONSUME = 1 << 2, is_consume, set_consume, "Removes matched items as they are returned.");
    mode_flag!(WAIT = 1 << 3, is_wait, set_wait, "Blocks until data becomes available instead of returning empty.");
    mode_flag!(NOTIFY = 1 << 4, is_notify, set_notify, "Requests a notification when matching data arrives.");
    mode_flag!(NEW_ONLY = 1 << 5, is_new_only, set_new_only, "Makes `put` fail if the key is already present.");
    mode_flag!(EXIST_ONLY = 1 << 6, is_exist_only, set_exist_only, "Makes `put`/`update` fail if the key is absent.");
    mode_flag!(NO_PREFIX = 1 << 7, is_no_prefix, set_no_prefix, "Disables the default prefix filter semantics.");
    mode_flag!(SUFFIX = 1 << 8, is_suffix, set_suffix, "Swaps the default prefix filter for a suffix filter.");
    mode_flag!(LUA_FILTER = 1 << 9, is_lua_filter, set_lua_filter, "Interprets the `filter` field as a Lua chunk.");
    mode_flag!(IGNORE_DOCS = 1 << 10, is_ignore_docs, set_ignore_docs, "Skips the document body, returning ids/metadata only.");
    mode_flag!(FILTER_VALUE = 1 << 11, is_filter_value, set_filter_value, "Evaluates the filter against the value instead of the key.");
    mode_flag!(LIB_FILTER = 1 << 12, is_lib_filter, set_lib_filter, "Interprets the `filter` field as a native filter spec.");
    mode_flag!(NO_RDMA = 1 << 13, is_no_rdma, set_no_rdma, "Switches the request to the direct (embedded-payload) RPC shape.");
    mode_flag!(UPDATE_NEW = 1 << 14, is_update_new, set_update_new, "Allows `update` to create the key if absent.");

    /// All bits this crate understands; used to reject unknown bits.
    const KNOWN_BITS: u32 = Self::INCLUSIVE
        | Self::APPEND
        | Self::CONSUME
        | Self::WAIT
        | Self::NOTIFY
        | Self::NEW_ONLY
        | Self::EXIST_ONLY
        | Self::NO_PREFIX
        | Self::SUFFIX
        | Self::LUA_FILTER
        | Self::IGNORE_DOCS
        | Self::FILTER_VALUE
        | Self::LIB_FILTER
        | Self::NO_RDMA
        | Self::UPDATE_NEW;

    /// Creates a mode with no flags set.
    pub fn new() -> Self {
        Mode { bits: BitMask32::new() }
    }

    /// Decodes a raw wire mode value, rejecting unknown bits.
    pub fn from_raw(raw: u32) -> crate::Result<Self> {
        if raw & !Self::KNOWN_BITS != 0 {
            return Err(crate::Error::InvalidArgs(format!(
                "mode contains unknown bits: {:#x}",
                raw & !Self::KNOWN_BITS
            )));
        }
        Ok(Mode { bits: BitMask32::from(raw) })
    }

    /// Returns the raw wire value of this mode.
    pub fn raw(&self) -> u32 {
        self.bits.bit_mask()
    }

    /// Whether any filter bit (Lua or native) is set.
    pub fn has_filter(&self) -> bool {
        self.is_lua_filter() || self.is_lib_filter()
    }
}

impl Default for Mode {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_bits() {
        assert!(Mode::from_raw(1 << 31).is_err());
    }

    #[test]
    fn accepts_known_bits_and_round_trips() {
        let raw = Mode::INCLUSIVE | Mode::SUFFIX | Mode::NO_RDMA;
        let mode = Mode::from_raw(raw).unwrap();
        assert!(mode.is_inclusive());
        assert!(mode.is_suffix());
        assert!(mode.is_no_rdma());
        assert!(!mode.is_append());
        assert_eq!(mode.raw(), raw);
    }

    #[test]
    fn setters_toggle_bits() {
        let mut mode = Mode::new();
        mode.set_lua_filter(true);
        assert!(mode.is_lua_filter());
        mode.set_lua_filter(false);
        assert!(!mode.is_lua_filter());
    }
}
