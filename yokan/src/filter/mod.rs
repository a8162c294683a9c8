//! The filter plane: prefix/suffix/Lua/native predicate and copy objects
//! applied inside a listing or iteration without materialising unmatched
//! records.

use crate::error::{Error, Result};
use crate::mode::Mode;

#[cfg(feature = "lua-filter")]
pub mod lua;

#[cfg(feature = "native-filter")]
pub mod native;

/// A pluggable predicate plus copy-step object for listing/iteration.
///
/// Backends must not cache filter instances across requests: a new filter
/// is built from the wire `filter` field and `mode` at the start of every
/// request.
pub trait Filter: Send + Sync {
    /// Whether the backend must load the value before `check` can decide.
    fn requires_value(&self) -> bool {
        false
    }

    /// Whether `key` (and, if loaded, `value`) matches this filter.
    fn check(&self, key: &[u8], value: Option<&[u8]>) -> bool;

    /// Whether a document matches this filter. Defaults to running `check`
    /// against the document's big-endian id and its body.
    fn check_doc(&self, id: u64, doc: &[u8]) -> bool {
        self.check(&id.to_be_bytes(), Some(doc))
    }

    /// The number of bytes `key_copy` will write for this key.
    fn key_size_from(&self, key: &[u8]) -> usize {
        key.len()
    }

    /// The number of bytes `value_copy` will write for this value.
    fn value_size_from(&self, value: &[u8]) -> usize {
        value.len()
    }

    /// Copies (possibly transforming) `key` into `dst`, which is exactly
    /// `key_size_from(key)` bytes long.
    fn key_copy(&self, dst: &mut [u8], key: &[u8]) {
        dst.copy_from_slice(key);
    }

    /// Copies (possibly transforming) `value` into `dst`, which is exactly
    /// `value_size_from(value)` bytes long.
    fn value_copy(&self, dst: &mut [u8], value: &[u8]) {
        dst.copy_from_slice(value);
    }
}

/// Matches every key; the default when no prefix/suffix bound applies.
pub struct AcceptAll;

impl Filter for AcceptAll {
    fn check(&self, _key: &[u8], _value: Option<&[u8]>) -> bool {
        true
    }
    fn check_doc(&self, _id: u64, _doc: &[u8]) -> bool {
        true
    }
}

/// Matches keys starting with `pattern`. This is the default filter.
pub struct PrefixFilter {
    pattern: Vec<u8>,
}

impl PrefixFilter {
    pub fn new(pattern: Vec<u8>) -> Self {
        PrefixFilter { pattern }
    }
}

impl Filter for PrefixFilter {
    fn check(&self, key: &[u8], _value: Option<&[u8]>) -> bool {
        key.starts_with(&self.pattern)
    }
}

/// Matches keys ending with `pattern` (selected by the `SUFFIX` mode bit).
pub struct SuffixFilter {
    pattern: Vec<u8>,
}

impl SuffixFilter {
    pub fn new(pattern: Vec<u8>) -> Self {
        SuffixFilter { pattern }
    }
}

impl Filter for SuffixFilter {
    fn check(&self, key: &[u8], _value: Option<&[u8]>) -> bool {
        key.ends_with(&self.pattern)
    }
}

/// Builds the filter selected by `mode` from the wire `filter` field.
///
/// The interpretation of `filter` depends entirely on which mode bits are
/// set: `LUA_FILTER` treats it as a Lua chunk, `LIB_FILTER` as a
/// `libname.so:symbol:argbytes` native filter spec, `SUFFIX` as a literal
/// suffix pattern, and otherwise (unless `NO_PREFIX` is set) as a literal
/// prefix pattern.
pub fn build_filter(mode: &Mode, filter: &[u8]) -> Result<Box<dyn Filter>> {
    if mode.is_lua_filter() {
        #[cfg(feature = "lua-filter")]
        {
            let chunk = std::str::from_utf8(filter)
                .map_err(|_| Error::InvalidArgs("Lua filter is not valid UTF-8".into()))?;
            return Ok(Box::new(lua::LuaFilter::new(chunk, mode.is_filter_value())?));
        }
        #[cfg(not(feature = "lua-filter"))]
        {
            return Err(Error::OpUnsupported("lua-filter"));
        }
    }

    if mode.is_lib_filter() {
        #[cfg(feature = "native-filter")]
        {
            return native::build(filter);
        }
        #[cfg(not(feature = "native-filter"))]
        {
            return Err(Error::OpUnsupported("native-filter"));
        }
    }

    if mode.is_no_prefix() {
        return Ok(Box::new(AcceptAll));
    }

    if mode.is_suffix() {
        return Ok(Box::new(SuffixFilter::new(filter.to_vec())));
    }

    Ok(Box::new(PrefixFilter::new(filter.to_vec())))
}
