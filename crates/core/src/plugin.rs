//! Runtime resolution of reader and decoder implementations.
//!
//! Plugins are ordinary shared objects exposing a single C-linkage factory
//! (`create_reader` / `create_abi`) that returns an owned boxed trait
//! object. The wrappers here keep the loaded [`Library`] alive for as long
//! as the instance it produced and forward the capability traits.
//!
//! Dynamic loading is an implementation choice, not a contract: the plugin
//! crates also build as plain rlibs and can be linked statically.

use std::path::Path;

use delegate::delegate;
use libloading::Library;
use log::debug;

use crate::abi::PythonAbi;
use crate::reader::{MemRegion, ProcessReader};
use crate::Error;

/// Conventional reader plugin filename for the compile-time OS.
pub fn reader_plugin_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "reader_windows.dll"
    } else if cfg!(target_os = "macos") {
        "reader_macos.so"
    } else {
        "reader_linux.so"
    }
}

/// Conventional decoder plugin filename for an interpreter version.
pub fn abi_plugin_name(major: u32, minor: u32) -> String {
    let suffix = if cfg!(target_os = "windows") { "dll" } else { "so" };
    format!("abi_cp{major}{minor}.{suffix}")
}

/// A [`ProcessReader`] resolved from a shared object.
pub struct ReaderPlugin {
    // The boxed instance must drop before the library that produced it
    // unloads; field order is load-bearing.
    reader: Box<dyn ProcessReader>,
    _library: Library,
}

impl ProcessReader for ReaderPlugin {
    delegate! {
        to self.reader {
            fn attach(&mut self, pid: u32) -> bool;
            fn detach(&mut self);
            fn read(&self, addr: u64, buf: &mut [u8]) -> bool;
            fn regions(&self) -> Vec<MemRegion>;
        }
    }
}

impl std::fmt::Debug for ReaderPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderPlugin").finish_non_exhaustive()
    }
}

/// A [`PythonAbi`] resolved from a shared object.
pub struct AbiPlugin {
    abi: Box<dyn PythonAbi>,
    _library: Library,
}

impl PythonAbi for AbiPlugin {
    delegate! {
        to self.abi {
            fn head_size(&self) -> usize;
            fn ob_type_from_head(&self, head: &[u8]) -> u64;
            fn is_type_object(&self, type_addr: u64, reader: &dyn ProcessReader) -> bool;
            fn type_name(&self, obj_addr: u64, reader: &dyn ProcessReader) -> String;
            fn type_id_from_type_addr(&self, type_addr: u64, reader: &dyn ProcessReader) -> u32;
            fn object_size(&self, obj_addr: u64, type_addr: u64, reader: &dyn ProcessReader) -> usize;
            fn object_flags(&self, obj_addr: u64, head: &[u8], reader: &dyn ProcessReader) -> u32;
            fn references(&self, obj_addr: u64, type_addr: u64, reader: &dyn ProcessReader) -> Vec<u64>;
            fn content_hash(
                &self,
                obj_addr: u64,
                size: usize,
                reader: &dyn ProcessReader,
                n_bytes: usize,
            ) -> u32;
            fn bfs_roots(&self, reader: &dyn ProcessReader) -> Vec<u64>;
            fn version_string(&self) -> String;
            fn major(&self) -> u32;
            fn minor(&self) -> u32;
            fn type_id_by_name(&self, name: &str) -> u32;
            fn type_name_from_id(&self, type_id: u32) -> Option<String>;
            fn clear_type_pool(&self);
        }
    }
}

/// Loads the reader plugin for the current OS by its conventional name.
///
/// Load and symbol-resolution failures are fatal to the caller.
pub fn load_reader() -> Result<ReaderPlugin, Error> {
    load_reader_from(reader_plugin_name())
}

/// Loads a reader plugin from an explicit path.
pub fn load_reader_from(path: impl AsRef<Path>) -> Result<ReaderPlugin, Error> {
    let name = path.as_ref().display().to_string();

    let library = unsafe { Library::new(path.as_ref()) }.map_err(|source| Error::PluginLoad {
        name: name.clone(),
        source,
    })?;

    let reader = unsafe {
        let create = library
            .get::<extern "C" fn() -> *mut dyn ProcessReader>(b"create_reader")
            .map_err(|source| Error::PluginSymbol {
                name: name.clone(),
                symbol: "create_reader",
                source,
            })?;
        Box::from_raw(create())
    };

    debug!("loaded reader plugin `{}`", name);
    Ok(ReaderPlugin {
        reader,
        _library: library,
    })
}

/// Loads the decoder plugin for an interpreter version by its conventional
/// name.
///
/// A missing or unresolvable plugin yields `None`; the caller decides
/// whether that is fatal.
pub fn load_abi(major: u32, minor: u32) -> Option<AbiPlugin> {
    load_abi_from(abi_plugin_name(major, minor))
}

/// Loads a decoder plugin from an explicit path.
pub fn load_abi_from(path: impl AsRef<Path>) -> Option<AbiPlugin> {
    let name = path.as_ref().display().to_string();

    let library = match unsafe { Library::new(path.as_ref()) } {
        Ok(library) => library,
        Err(err) => {
            debug!("decoder plugin `{}` not loadable: {}", name, err);
            return None;
        }
    };

    let abi = unsafe {
        match library.get::<extern "C" fn() -> *mut dyn PythonAbi>(b"create_abi") {
            Ok(create) => Box::from_raw(create()),
            Err(err) => {
                debug!("decoder plugin `{}` lacks create_abi: {}", name, err);
                return None;
            }
        }
    };

    debug!("loaded decoder plugin `{}`", name);
    Some(AbiPlugin {
        abi,
        _library: library,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_plugin_names_follow_the_convention() {
        let name = abi_plugin_name(3, 10);
        if cfg!(target_os = "windows") {
            assert_eq!(name, "abi_cp310.dll");
        } else {
            assert_eq!(name, "abi_cp310.so");
        }
    }

    #[test]
    fn missing_reader_plugin_is_fatal() {
        let err = load_reader_from("/nonexistent/reader_linux.so").unwrap_err();
        assert!(matches!(err, Error::PluginLoad { .. }));
    }

    #[test]
    fn missing_abi_plugin_is_not_fatal() {
        assert!(load_abi_from("/nonexistent/abi_cp310.so").is_none());
    }
}
