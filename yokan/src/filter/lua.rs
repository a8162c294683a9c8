//! The Lua filter: evaluates a user-supplied chunk with the key/value (or
//! id/document) bound as globals.

use mlua::Lua;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::filter::Filter;

/// A filter that evaluates a Lua chunk against each candidate.
///
/// For key/value operations the chunk sees `__key__` and, when
/// `FILTER_VALUE` is set, `__value__`. For document operations it sees
/// `__id__` and `__doc__`. The chunk's last expression is its boolean
/// verdict.
pub struct LuaFilter {
    lua: Mutex<Lua>,
    chunk: String,
    wants_value: bool,
}

impl LuaFilter {
    pub fn new(chunk: &str, wants_value: bool) -> Result<Self> {
        Ok(LuaFilter {
            lua: Mutex::new(Lua::new()),
            chunk: chunk.to_string(),
            wants_value,
        })
    }

    fn eval(&self, lua: &Lua) -> Result<bool> {
        lua.load(&self.chunk)
            .eval::<bool>()
            .map_err(|e| Error::InvalidArgs(format!("Lua filter error: {}", e)))
    }
}

impl Filter for LuaFilter {
    fn requires_value(&self) -> bool {
        self.wants_value
    }

    fn check(&self, key: &[u8], value: Option<&[u8]>) -> bool {
        let lua = self.lua.lock();
        let globals = lua.globals();
        let _ = globals.set("__key__", lua.create_string(key).ok());
        if let Some(value) = value {
            let _ = globals.set("__value__", lua.create_string(value).ok());
        }
        self.eval(&lua).unwrap_or(false)
    }

    fn check_doc(&self, id: u64, doc: &[u8]) -> bool {
        let lua = self.lua.lock();
        let globals = lua.globals();
        let _ = globals.set("__id__", id);
        let _ = globals.set("__doc__", lua.create_string(doc).ok());
        self.eval(&lua).unwrap_or(false)
    }
}
