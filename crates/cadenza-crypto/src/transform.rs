//! Sandboxed bytecode transform stage
//!
//! The module exposes a narrow ABI:
//!
//! - `allocate(len) -> ptr` places host buffers in the module's linear memory
//! - `transform(slot, data_ptr, data_len, track_ptr, track_len)` writes a
//!   little-endian `(result_ptr, result_len)` pair into the 8-byte `slot`
//! - an exported linear memory the host reads results from
//!
//! Some builds also export a stack-pointer adjuster; when configured, the
//! output slot is carved from the module's stack instead of `allocate`.
//! When a `free(ptr, len)` export is configured, every buffer the host
//! obtained from `allocate` and the result buffer are released after the
//! output is copied out.

use std::path::PathBuf;
use std::sync::OnceLock;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use wasmtime::{Engine, Linker, Memory, Module, Store, TypedFunc};

use crate::error::{CryptoError, CryptoResult};

const SLOT_LEN: i32 = 8;
const STACK_FRAME: i32 = 16;

/// Names of the module exports used by the transform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformExports {
    /// `allocate(len) -> ptr`
    pub allocate: String,
    /// `transform(slot, data_ptr, data_len, track_ptr, track_len)`
    pub transform: String,
    /// Linear memory
    pub memory: String,
    /// Optional `stack_adjust(delta) -> sp`
    pub stack_adjust: Option<String>,
    /// Optional `free(ptr, len)`
    pub free: Option<String>,
}

impl Default for TransformExports {
    fn default() -> Self {
        Self {
            allocate: "allocate".to_string(),
            transform: "transform".to_string(),
            memory: "memory".to_string(),
            stack_adjust: None,
            free: None,
        }
    }
}

/// Where the module bytes come from
#[derive(Debug, Clone)]
pub enum ModuleSource {
    /// Binary or text module on disk
    File(PathBuf),
    /// Binary or text module in memory
    Bytes(Vec<u8>),
}

struct LoadedModule {
    store: Store<()>,
    memory: Memory,
    allocate: TypedFunc<i32, i32>,
    transform: TypedFunc<(i32, i32, i32, i32, i32), ()>,
    stack_adjust: Option<TypedFunc<i32, i32>>,
    free: Option<TypedFunc<(i32, i32), ()>>,
}

fn unavailable(context: &str, err: impl std::fmt::Display) -> CryptoError {
    CryptoError::ModuleUnavailable(format!("{context}: {err}"))
}

fn failure(context: &str, err: impl std::fmt::Display) -> CryptoError {
    CryptoError::TransformFailure(format!("{context}: {err}"))
}

impl LoadedModule {
    fn load(source: &ModuleSource, exports: &TransformExports) -> CryptoResult<Self> {
        let engine = Engine::default();
        let module = match source {
            ModuleSource::File(path) => Module::from_file(&engine, path)
                .map_err(|e| unavailable(&path.display().to_string(), e))?,
            ModuleSource::Bytes(bytes) => {
                Module::new(&engine, bytes).map_err(|e| unavailable("compile", e))?
            }
        };

        let mut store = Store::new(&engine, ());
        let mut linker = Linker::new(&engine);
        linker
            .define_unknown_imports_as_traps(&module)
            .map_err(|e| unavailable("link", e))?;
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| unavailable("instantiate", e))?;

        let memory = instance
            .get_memory(&mut store, &exports.memory)
            .ok_or_else(|| unavailable("missing memory export", &exports.memory))?;
        let allocate = instance
            .get_typed_func::<i32, i32>(&mut store, &exports.allocate)
            .map_err(|e| unavailable(&exports.allocate, e))?;
        let transform = instance
            .get_typed_func::<(i32, i32, i32, i32, i32), ()>(&mut store, &exports.transform)
            .map_err(|e| unavailable(&exports.transform, e))?;
        let stack_adjust = match &exports.stack_adjust {
            Some(name) => Some(
                instance
                    .get_typed_func::<i32, i32>(&mut store, name)
                    .map_err(|e| unavailable(name, e))?,
            ),
            None => None,
        };
        let free = match &exports.free {
            Some(name) => Some(
                instance
                    .get_typed_func::<(i32, i32), ()>(&mut store, name)
                    .map_err(|e| unavailable(name, e))?,
            ),
            None => None,
        };

        Ok(Self {
            store,
            memory,
            allocate,
            transform,
            stack_adjust,
            free,
        })
    }

    fn place(&mut self, bytes: &[u8]) -> CryptoResult<(i32, i32)> {
        let len = i32::try_from(bytes.len()).map_err(|e| failure("input too large", e))?;
        let ptr = self
            .allocate
            .call(&mut self.store, len)
            .map_err(|e| failure("allocate", e))?;
        if ptr < 0 {
            return Err(failure("allocate", format!("returned pointer {ptr}")));
        }
        self.memory
            .write(&mut self.store, ptr as usize, bytes)
            .map_err(|e| failure("write input", e))?;
        Ok((ptr, len))
    }

    fn invoke(&mut self, data: &[u8], track_id: &[u8]) -> CryptoResult<Vec<u8>> {
        let slot = match &self.stack_adjust {
            Some(adjust) => adjust
                .call(&mut self.store, -STACK_FRAME)
                .map_err(|e| failure("stack adjust", e))?,
            None => self
                .allocate
                .call(&mut self.store, SLOT_LEN)
                .map_err(|e| failure("allocate slot", e))?,
        };
        if slot < 0 {
            return Err(failure("output slot", format!("invalid pointer {slot}")));
        }

        let result = self.invoke_with_slot(slot, data, track_id);

        if let Some(adjust) = self.stack_adjust.clone() {
            adjust
                .call(&mut self.store, STACK_FRAME)
                .map_err(|e| failure("stack restore", e))?;
        } else {
            self.release(slot, SLOT_LEN)?;
        }
        result
    }

    fn release(&mut self, ptr: i32, len: i32) -> CryptoResult<()> {
        if let Some(free) = &self.free {
            free.call(&mut self.store, (ptr, len))
                .map_err(|e| failure("free", e))?;
        }
        Ok(())
    }

    fn invoke_with_slot(
        &mut self,
        slot: i32,
        data: &[u8],
        track_id: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        let (data_ptr, data_len) = self.place(data)?;
        let (track_ptr, track_len) = self.place(track_id)?;

        self.transform
            .call(
                &mut self.store,
                (slot, data_ptr, data_len, track_ptr, track_len),
            )
            .map_err(|e| failure("transform", e))?;

        let mut pair = [0u8; 8];
        self.memory
            .read(&self.store, slot as usize, &mut pair)
            .map_err(|e| failure("read output slot", e))?;
        let ptr = i32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]);
        let len = i32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]);
        if len < 0 {
            return Err(failure("transform", format!("negative length {len}")));
        }
        if ptr < 0 {
            return Err(failure("transform", format!("invalid pointer {ptr}")));
        }

        let mut out = vec![0u8; len as usize];
        self.memory
            .read(&self.store, ptr as usize, &mut out)
            .map_err(|e| failure("read output", format!("pointer {ptr} length {len}: {e}")))?;

        // The result may alias an input buffer; release each pointer once.
        self.release(data_ptr, data_len)?;
        self.release(track_ptr, track_len)?;
        if ptr != data_ptr && ptr != track_ptr {
            self.release(ptr, len)?;
        }
        Ok(out)
    }
}

/// Bytecode transform stage.
///
/// The module is compiled and instantiated on first use. Concurrent first
/// calls serialize on an init lock so the module loads once; a failed load
/// is retried on the next call. Calls into the instance are serialized.
pub struct BytecodeTransform {
    source: ModuleSource,
    exports: TransformExports,
    init: Mutex<()>,
    loaded: OnceLock<Mutex<LoadedModule>>,
}

impl std::fmt::Debug for BytecodeTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BytecodeTransform")
            .field("source", &self.source)
            .field("exports", &self.exports)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl BytecodeTransform {
    /// Create a stage; nothing is loaded until the first call.
    pub fn new(source: ModuleSource, exports: TransformExports) -> Self {
        Self {
            source,
            exports,
            init: Mutex::new(()),
            loaded: OnceLock::new(),
        }
    }

    /// Whether the module has been instantiated
    pub fn is_loaded(&self) -> bool {
        self.loaded.get().is_some()
    }

    fn module(&self) -> CryptoResult<&Mutex<LoadedModule>> {
        if let Some(module) = self.loaded.get() {
            return Ok(module);
        }

        let _guard = self.init.lock();
        if let Some(module) = self.loaded.get() {
            return Ok(module);
        }

        tracing::info!(source = ?self.source, "loading transform module");
        let module = LoadedModule::load(&self.source, &self.exports)?;
        Ok(self.loaded.get_or_init(|| Mutex::new(module)))
    }

    /// Run the module on `intermediate` and return its raw text output.
    pub fn run(&self, intermediate: &str, track_id: &str) -> CryptoResult<String> {
        let output = self
            .module()?
            .lock()
            .invoke(intermediate.as_bytes(), track_id.as_bytes())?;
        String::from_utf8(output).map_err(|e| failure("output is not UTF-8", e))
    }

    /// Run the module, prefix its output with `marker` and base64-decode.
    pub fn decode(
        &self,
        intermediate: &str,
        track_id: &str,
        marker: &str,
    ) -> CryptoResult<Vec<u8>> {
        let text = self.run(intermediate, track_id)?;
        let mut joined = String::with_capacity(marker.len() + text.len());
        joined.push_str(marker);
        joined.push_str(&text);
        STANDARD
            .decode(joined.trim_end_matches('\0'))
            .map_err(|e| failure("base64 decode", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    /// Bump allocator plus a transform that echoes the data buffer
    const IDENTITY_WAT: &str = r#"
        (module
          (memory (export "memory") 1)
          (global $bump (mut i32) (i32.const 1024))
          (func $allocate (export "allocate") (param $len i32) (result i32)
            (local $ptr i32)
            (local.set $ptr (global.get $bump))
            (global.set $bump (i32.add (global.get $bump) (local.get $len)))
            (if (i32.gt_u (global.get $bump) (i32.mul (memory.size) (i32.const 65536)))
              (then
                (drop (memory.grow
                  (i32.add
                    (i32.div_u
                      (i32.sub (global.get $bump) (i32.mul (memory.size) (i32.const 65536)))
                      (i32.const 65536))
                    (i32.const 1))))))
            (local.get $ptr))
          (func (export "transform")
            (param $slot i32) (param $data i32) (param $len i32) (param $track i32) (param $tlen i32)
            (i32.store (local.get $slot) (local.get $data))
            (i32.store offset=4 (local.get $slot) (local.get $len))))
    "#;

    const TRACK_ECHO_WAT: &str = r#"
        (module
          (memory (export "memory") 1)
          (global $bump (mut i32) (i32.const 64))
          (global $sp (mut i32) (i32.const 60000))
          (func (export "allocate") (param $len i32) (result i32)
            (local $ptr i32)
            (local.set $ptr (global.get $bump))
            (global.set $bump (i32.add (global.get $bump) (local.get $len)))
            (local.get $ptr))
          (func (export "stack") (param $delta i32) (result i32)
            (global.set $sp (i32.add (global.get $sp) (local.get $delta)))
            (global.get $sp))
          (func (export "transform")
            (param $slot i32) (param $data i32) (param $len i32) (param $track i32) (param $tlen i32)
            (i32.store (local.get $slot) (local.get $track))
            (i32.store offset=4 (local.get $slot) (local.get $tlen))))
    "#;

    const NEGATIVE_LEN_WAT: &str = r#"
        (module
          (memory (export "memory") 1)
          (func (export "allocate") (param i32) (result i32) (i32.const 128))
          (func (export "transform") (param i32 i32 i32 i32 i32)
            (i32.store (local.get 0) (local.get 1))
            (i32.store offset=4 (local.get 0) (i32.const -1))))
    "#;

    const WILD_POINTER_WAT: &str = r#"
        (module
          (memory (export "memory") 1)
          (func (export "allocate") (param i32) (result i32) (i32.const 128))
          (func (export "transform") (param i32 i32 i32 i32 i32)
            (i32.store (local.get 0) (i32.const 0x7fff0000))
            (i32.store offset=4 (local.get 0) (i32.const 16))))
    "#;

    /// Copies the data into a fresh result buffer; `free` tallies its calls
    /// at address 0 and the released byte count at address 4
    const FREEING_WAT: &str = r#"
        (module
          (memory (export "memory") 1)
          (global $bump (mut i32) (i32.const 64))
          (func $allocate (export "allocate") (param $len i32) (result i32)
            (local $ptr i32)
            (local.set $ptr (global.get $bump))
            (global.set $bump (i32.add (global.get $bump) (local.get $len)))
            (local.get $ptr))
          (func (export "free") (param $ptr i32) (param $len i32)
            (i32.store (i32.const 0) (i32.add (i32.load (i32.const 0)) (i32.const 1)))
            (i32.store (i32.const 4) (i32.add (i32.load (i32.const 4)) (local.get $len))))
          (func (export "transform")
            (param $slot i32) (param $data i32) (param $len i32) (param $track i32) (param $tlen i32)
            (local $out i32)
            (local.set $out (call $allocate (local.get $len)))
            (memory.copy (local.get $out) (local.get $data) (local.get $len))
            (i32.store (local.get $slot) (local.get $out))
            (i32.store offset=4 (local.get $slot) (local.get $len))))
    "#;

    fn free_tally(stage: &BytecodeTransform) -> (u32, u32) {
        let loaded = stage.module().unwrap().lock();
        let mut raw = [0u8; 8];
        loaded.memory.read(&loaded.store, 0, &mut raw).unwrap();
        (
            u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
        )
    }

    fn identity() -> BytecodeTransform {
        BytecodeTransform::new(
            ModuleSource::Bytes(IDENTITY_WAT.as_bytes().to_vec()),
            TransformExports::default(),
        )
    }

    #[test]
    fn test_loads_lazily() {
        let stage = identity();
        assert!(!stage.is_loaded());
        assert_eq!(stage.run("abc", "0").unwrap(), "abc");
        assert!(stage.is_loaded());
    }

    #[test]
    fn test_decode_prefixes_marker() {
        // "aGVsbG8=" is base64("hello")
        let out = identity().decode("bG8=", "0", "aGVs").unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn test_large_input_grows_memory() {
        let input = "QUJD".repeat(40_000);
        let out = identity().run(&input, "0").unwrap();
        assert_eq!(out.len(), input.len());
    }

    #[test]
    fn test_stack_slot_and_track_id() {
        let stage = BytecodeTransform::new(
            ModuleSource::Bytes(TRACK_ECHO_WAT.as_bytes().to_vec()),
            TransformExports {
                stack_adjust: Some("stack".to_string()),
                ..TransformExports::default()
            },
        );
        assert_eq!(stage.run("ignored", "42").unwrap(), "42");
        assert_eq!(stage.run("ignored", "7").unwrap(), "7");
    }

    #[test]
    fn test_negative_length_is_failure() {
        let stage = BytecodeTransform::new(
            ModuleSource::Bytes(NEGATIVE_LEN_WAT.as_bytes().to_vec()),
            TransformExports::default(),
        );
        let err = stage.run("abc", "0").unwrap_err();
        assert!(matches!(err, CryptoError::TransformFailure(ref m) if m.contains("negative length")));
    }

    #[test]
    fn test_wild_pointer_is_failure() {
        let stage = BytecodeTransform::new(
            ModuleSource::Bytes(WILD_POINTER_WAT.as_bytes().to_vec()),
            TransformExports::default(),
        );
        assert!(matches!(
            stage.run("abc", "0"),
            Err(CryptoError::TransformFailure(_))
        ));
    }

    #[test]
    fn test_missing_export_is_unavailable() {
        let stage = BytecodeTransform::new(
            ModuleSource::Bytes(IDENTITY_WAT.as_bytes().to_vec()),
            TransformExports {
                transform: "xmDecrypt".to_string(),
                ..TransformExports::default()
            },
        );
        assert!(matches!(
            stage.run("abc", "0"),
            Err(CryptoError::ModuleUnavailable(_))
        ));
        assert!(!stage.is_loaded());
    }

    #[test]
    fn test_invalid_base64_is_failure() {
        let err = identity().decode("!!!", "0", "").unwrap_err();
        assert!(matches!(err, CryptoError::TransformFailure(ref m) if m.contains("base64")));
    }

    #[test]
    fn test_concurrent_first_use_loads_once() {
        let stage = Arc::new(identity());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let stage = Arc::clone(&stage);
                std::thread::spawn(move || stage.run(&format!("input{i}"), "1").unwrap())
            })
            .collect();
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.join().unwrap(), format!("input{i}"));
        }
    }

    #[test]
    fn test_free_export_releases_every_buffer() {
        let stage = BytecodeTransform::new(
            ModuleSource::Bytes(FREEING_WAT.as_bytes().to_vec()),
            TransformExports {
                free: Some("free".to_string()),
                ..TransformExports::default()
            },
        );
        assert_eq!(stage.run("abcdef", "42").unwrap(), "abcdef");
        // slot, data, track id and result
        assert_eq!(free_tally(&stage), (4, 8 + 6 + 2 + 6));

        assert_eq!(stage.run("xyz", "7").unwrap(), "xyz");
        assert_eq!(free_tally(&stage), (8, 22 + 8 + 3 + 1 + 3));
    }

    #[test]
    fn test_free_skips_result_aliasing_input() {
        let wat = IDENTITY_WAT.replace(
            "(func (export \"transform\")",
            "(func (export \"free\") (param i32 i32)\n            (i32.store (i32.const 0) (i32.add (i32.load (i32.const 0)) (i32.const 1))))\n          (func (export \"transform\")",
        );
        let stage = BytecodeTransform::new(
            ModuleSource::Bytes(wat.into_bytes()),
            TransformExports {
                free: Some("free".to_string()),
                ..TransformExports::default()
            },
        );
        assert_eq!(stage.run("abc", "0").unwrap(), "abc");
        // slot, data and track id; the echoed result is the data buffer
        assert_eq!(free_tally(&stage).0, 3);
    }

    #[test]
    fn test_missing_free_export_is_unavailable() {
        let stage = BytecodeTransform::new(
            ModuleSource::Bytes(IDENTITY_WAT.as_bytes().to_vec()),
            TransformExports {
                free: Some("dealloc".to_string()),
                ..TransformExports::default()
            },
        );
        assert!(matches!(
            stage.run("abc", "0"),
            Err(CryptoError::ModuleUnavailable(_))
        ));
    }
}
