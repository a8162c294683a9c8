//! The native (dynamically loaded `.so`) filter.
//!
//! The wire `filter` field is a `libname.so:symbol:argbytes` spec: the
//! library is loaded (or reused, if already loaded), the named factory
//! symbol is looked up in a process-global registry, and the remaining
//! bytes are passed to it as opaque configuration.

use std::collections::HashMap;
use std::sync::Arc;

use libloading::Library;
use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::filter::Filter;

/// A factory that builds a [`Filter`] from its opaque configuration bytes.
pub type FilterFactory = fn(&[u8]) -> Box<dyn Filter>;

struct Registry {
    libraries: HashMap<String, Arc<Library>>,
    factories: HashMap<String, FilterFactory>,
}

static REGISTRY: Lazy<RwLock<Registry>> = Lazy::new(|| {
    RwLock::new(Registry {
        libraries: HashMap::new(),
        factories: HashMap::new(),
    })
});

/// Registers a factory under `symbol` for later lookup by native filter
/// specs that name it. Intended to be called once at process init.
pub fn register(symbol: &str, factory: FilterFactory) {
    REGISTRY.write().factories.insert(symbol.to_string(), factory);
}

/// Parses a `libname.so:symbol:argbytes` spec and builds the named filter.
///
/// Both the symbol lookup and the filter instantiation happen on the
/// calling thread; the resulting filter is never cached across requests.
pub fn build(spec: &[u8]) -> Result<Box<dyn Filter>> {
    let spec = std::str::from_utf8(spec)
        .map_err(|_| Error::InvalidArgs("native filter spec is not valid UTF-8".into()))?;

    let mut parts = spec.splitn(3, ':');
    let libname = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::InvalidArgs("native filter spec missing library name".into()))?;
    let symbol = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::InvalidArgs("native filter spec missing symbol name".into()))?;
    let argbytes = parts.next().unwrap_or("").as_bytes();

    ensure_loaded(libname)?;

    let factory = {
        let registry = REGISTRY.read();
        *registry
            .factories
            .get(symbol)
            .ok_or_else(|| Error::InvalidArgs(format!("unregistered native filter symbol: {}", symbol)))?
    };

    Ok(factory(argbytes))
}

fn ensure_loaded(libname: &str) -> Result<()> {
    if REGISTRY.read().libraries.contains_key(libname) {
        return Ok(());
    }
    let mut registry = REGISTRY.write();
    if registry.libraries.contains_key(libname) {
        return Ok(());
    }
    // Safety: loading an operator-supplied shared library is inherently
    // unsafe; the caller is trusted to name a library implementing this
    // crate's filter ABI.
    let lib = unsafe { Library::new(libname) }
        .map_err(|e| Error::InvalidArgs(format!("failed to load native filter library {}: {}", libname, e)))?;
    registry.libraries.insert(libname.to_string(), Arc::new(lib));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::AcceptAll;

    fn accept_all_factory(_args: &[u8]) -> Box<dyn Filter> {
        Box::new(AcceptAll)
    }

    #[test]
    fn unregistered_symbol_fails_with_invalid_args() {
        match build(b"/nonexistent.so:missing_symbol:") {
            Ok(_) => panic!("expected build to fail"),
            Err(err) => assert!(matches!(err, Error::InvalidArgs(_))),
        }
    }

    #[test]
    fn registered_factory_is_used() {
        register("yokan_test_accept_all", accept_all_factory);
        // Skip the library-loading half of the path by calling the factory
        // directly, since this process has no real .so to load.
        let filter = accept_all_factory(b"");
        assert!(filter.check(b"anything", None));
    }
}
