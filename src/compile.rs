//! The compile pipeline: preprocess, front-end, encode, cache.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use anyhow::{bail, Context};

use lyrical_backend::interp::{run, Outcome, RunConfig};
use lyrical_cache::{BinMap, CacheEntry};
use lyrical_codegen::backend::BackendResult;
use lyrical_codegen::{CompileFlags, DebugInfo, EmitConfig, RegionAlignment};
use lyrical_preprocess::{preprocess, PredeclaredMacro, PreprocessConfig};

use crate::frontend;

/// Byte size of the portable target's general purpose registers.
pub const SIZEOF_GPR: u32 = 8;

/// Region alignment the driver compiles and loads with.
pub const ALIGNMENT: RegionAlignment = RegionAlignment::PageAligned;

pub struct CompileOptions {
    /// Write a human-readable compilation log to the cache.
    pub log: bool,
    /// Emit debug info to the cache.
    pub debug: bool,
    pub cache_root: PathBuf,
    /// Standard include directory; its `_.install` script is invoked for
    /// missing modules.
    pub lib_dir: PathBuf,
    pub uid: u32,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            log: false,
            debug: false,
            cache_root: std::env::var_os("LYRICAL_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/var/cache/lyrical")),
            lib_dir: std::env::var_os("LYRICAL_LIB_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/lib/lyrical")),
            uid: current_uid(),
        }
    }
}

fn current_uid() -> u32 {
    #[cfg(unix)]
    {
        // Safety: getuid has no failure modes or side effects.
        unsafe { libc::getuid() }
    }
    #[cfg(not(unix))]
    {
        0
    }
}

#[derive(Debug)]
pub struct Compiled {
    pub bin: Vec<u8>,
    pub map: BinMap,
    pub entry: CacheEntry,
    /// False when the cache was fresh and the rebuild was skipped.
    pub rebuilt: bool,
    /// Directory of the compiled source, used as the server's document
    /// root.
    pub source_dir: PathBuf,
}

impl Compiled {
    pub fn backend_result(&self) -> BackendResult {
        BackendResult {
            exec: self.bin.clone(),
            executable_instr_size: self.map.executable_instr_size,
            constant_strings_size: self.map.constant_strings_size,
            global_region_size: self.map.global_region_size,
            export_info: Vec::new(),
            import_info: Vec::new(),
            dbg_info: Vec::new(),
        }
    }
}

/// Compile `source`, reusing the cache when it is still fresh.
pub fn compile_file(source: &Path, opts: &CompileOptions) -> anyhow::Result<Compiled> {
    let abs = std::fs::canonicalize(source)
        .with_context(|| format!("input file not found: {}", source.display()))?;
    let source_dir = abs
        .parent()
        .map(Path::to_owned)
        .unwrap_or_else(|| PathBuf::from("/"));
    let entry = CacheEntry::for_source(&opts.cache_root, opts.uid, &abs);

    if entry.is_valid(SIZEOF_GPR) {
        log::info!("cache fresh for {}", abs.display());
        let bin = entry.load_bin()?;
        let map = entry.load_map(SIZEOF_GPR)?;
        return Ok(Compiled {
            bin,
            map,
            entry,
            rebuilt: false,
            source_dir,
        });
    }

    // Driver-synthesized top-level source: one include of the program.
    let driver_source = format!("`include \"{}\"", abs.display());
    let lib_dir = opts.lib_dir.clone();
    let pp_config = PreprocessConfig {
        standard_paths: vec![opts.lib_dir.clone()],
        predeclared_macros: vec![
            PredeclaredMacro {
                name: "uint".into(),
                content: "u64".into(),
            },
            PredeclaredMacro {
                name: "sint".into(),
                content: "s64".into(),
            },
        ],
        lyx_append: Some(".stdsckout();".into()),
        install_missing_module: Some(Box::new(move |module: &str| {
            install_missing_module(&lib_dir, module)
        })),
        cwd: Some(source_dir.clone()),
    };
    let preprocessed = preprocess(&driver_source, pp_config).map_err(|e| anyhow::anyhow!("{e}"))?;

    let mut emit_cfg = EmitConfig::for_word_size(SIZEOF_GPR);
    if opts.log {
        emit_cfg.flags |= CompileFlags::COMMENT;
    }
    if opts.debug {
        emit_cfg.flags |= CompileFlags::DEBUG_INFO;
    }
    // Instructions inherit the provenance of the chunk their source text
    // came from.
    let lookup = |offset: usize| -> DebugInfo {
        let Some(id) = preprocessed.chunk_at(offset) else {
            return DebugInfo::default();
        };
        let chunk = preprocessed.store.chunk(id);
        DebugInfo {
            filepath: (!chunk.path.as_os_str().is_empty())
                .then(|| Arc::from(chunk.path.to_string_lossy().as_ref())),
            line: chunk.line,
            line_offset: chunk.offset as u32,
            bin_offset: 0,
        }
    };
    let result = frontend::compile_to_result(
        &preprocessed.source,
        &emit_cfg,
        preprocessed.src_file_paths.clone(),
        &lookup,
    )?;

    let backend = lyrical_backend::encode(&result, ALIGNMENT, SIZEOF_GPR, opts.debug)?;
    if !backend.import_info.is_empty() {
        bail!("import support not yet implemented");
    }
    if !backend.export_info.is_empty() {
        bail!("export support not yet implemented");
    }

    let log_text = if opts.log {
        let mut text = String::new();
        lyrical_codegen::write::write_compile_result(&mut text, &result)
            .expect("writing to a string cannot fail");
        Some(text)
    } else {
        None
    };
    let map = BinMap {
        executable_instr_size: backend.executable_instr_size,
        constant_strings_size: backend.constant_strings_size,
        global_region_size: backend.global_region_size,
    };
    entry.store(
        &result.src_file_list(),
        &backend.exec,
        map,
        SIZEOF_GPR,
        log_text.as_deref(),
        opts.debug.then_some(backend.dbg_info.as_slice()),
    )?;
    log::info!("compiled {} ({} bytes)", abs.display(), backend.exec.len());
    Ok(Compiled {
        bin: backend.exec,
        map,
        entry,
        rebuilt: true,
        source_dir,
    })
}

/// Execute a compiled program in the portable interpreter.
pub fn run_compiled(compiled: &Compiled) -> anyhow::Result<Outcome> {
    let backend = compiled.backend_result();
    run(&backend, ALIGNMENT, &RunConfig::default()).map_err(Into::into)
}

/// Invoke the standard-path installer script for a missing module; a
/// successful exit restarts the include search.
fn install_missing_module(lib_dir: &Path, module: &str) -> bool {
    let script = lib_dir.join("_.install");
    if !script.is_file() {
        return false;
    }
    Command::new("sh")
        .arg("-c")
        .arg(format!("exec '{}' '{module}' 1>&2", script.display()))
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
