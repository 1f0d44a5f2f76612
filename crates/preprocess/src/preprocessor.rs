//! The recursive preprocessor.
//!
//! One `run` invocation scans one region of one source buffer under an
//! [`Action`] that decides which terminators return control, which
//! directives are legal, and whether newlines terminate. Includes, macro
//! bodies, macro arguments, conditional blocks and `foreach` bodies are all
//! recursive `run` calls over the same per-character loop.
//!
//! All the state the original kept in module-level statics (the macro
//! table, the ambient chunk origin, the include stack, the module dedup
//! set, the current working directory and file path) lives in the
//! [`Preprocessor`] context threaded through every recursive call.

use std::path::{Path, PathBuf};

use rustc_hash::FxHashSet;

use crate::chunk::{ChunkId, ChunkStore};
use crate::error::{Error, Location, Result};
use crate::macros::{Macro, MacroId, MacroKind, MacroTable};
use crate::scan::{ScanError, Scanner, StringMode, Symbol};

/// Character sequence opening an export-inference scope around a module's
/// `.lyc` content. Fixed by the front-end, opaque to the preprocessor.
pub const EXPORT_SCOPE_OPEN: &str = "\n#+e{\n";
/// Closing counterpart of [`EXPORT_SCOPE_OPEN`].
pub const EXPORT_SCOPE_CLOSE: &str = "\n}#-e\n";

/// A macro registered by the embedder before preprocessing starts.
///
/// The name must use only digits and uppercase letters, must not start with
/// a digit, and cannot be `FILE` or `LINE`. The content must not contain a
/// newline or line numbers would be reported incorrectly.
#[derive(Clone, Debug)]
pub struct PredeclaredMacro {
    pub name: String,
    pub content: String,
}

/// Callback invoked when an `` `include `` target could not be found in the
/// standard paths. Returning `true` restarts the search.
pub type InstallModuleHook<'a> = Box<dyn FnMut(&str) -> bool + 'a>;

/// Embedder configuration for a preprocessing session.
#[derive(Default)]
pub struct PreprocessConfig<'a> {
    /// Absolute directories searched for `` `include `` paths that do not
    /// start with `/`, `./` or `../`, in order.
    pub standard_paths: Vec<PathBuf>,
    pub predeclared_macros: Vec<PredeclaredMacro>,
    /// Appended to every double-quoted string literal generated from `.lyx`
    /// text outside `<% … %>` code blocks.
    pub lyx_append: Option<String>,
    pub install_missing_module: Option<InstallModuleHook<'a>>,
    /// Base directory for relative include resolution. Defaults to the
    /// process working directory.
    pub cwd: Option<PathBuf>,
}

/// The preprocessing result: the chunk ring, its concatenation, and the
/// list of source files that were read.
#[derive(Debug)]
pub struct Preprocessed {
    pub store: ChunkStore,
    /// Head of the final ring. Module chunks come first, in first-seen
    /// order, then everything else in source order.
    pub head: Option<ChunkId>,
    /// Concatenation of every chunk's content in forward order.
    pub source: String,
    /// `(start offset within source, chunk)` per chunk, ascending.
    pub spans: Vec<(usize, ChunkId)>,
    /// Canonical absolute paths of every file consumed, in read order.
    pub src_file_paths: Vec<PathBuf>,
}

impl Preprocessed {
    /// The chunk a byte of the final source came from.
    pub fn chunk_at(&self, offset: usize) -> Option<ChunkId> {
        if offset >= self.source.len() {
            return None;
        }
        match self.spans.binary_search_by_key(&offset, |&(o, _)| o) {
            Ok(i) => Some(self.spans[i].1),
            Err(0) => None,
            Err(i) => Some(self.spans[i - 1].1),
        }
    }
}

/// Preprocess `source`, which is the driver-synthesized top-level text
/// (typically a couple of `` `include `` directives).
pub fn preprocess(source: &str, mut config: PreprocessConfig<'_>) -> Result<Preprocessed> {
    let initial_cwd = config
        .cwd
        .take()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("/"));
    let mut pp = Preprocessor {
        standard_paths: std::mem::take(&mut config.standard_paths),
        lyx_append: config.lyx_append.take(),
        installer: config.install_missing_module.take(),
        cwd: initial_cwd.clone(),
        initial_cwd,
        store: ChunkStore::new(),
        macros: MacroTable::new(),
        module_chunks: None,
        already_included_modules: FxHashSet::default(),
        include_stack: Vec::new(),
        current_path: PathBuf::new(),
        chunk_origin: None,
        defining_depth: 0,
        src_file_paths: Vec::new(),
    };
    pp.register_predeclared(&config.predeclared_macros);
    let mut scan = Scanner::new(source);
    let (head, _term) = pp.run(&mut scan, Action::Begin)?;
    let mut all = pp.module_chunks.take();
    if let Some(h) = head {
        pp.store.attach(&mut all, h);
    }
    let (text, spans) = pp.store.concatenate(all);
    log::debug!(
        "preprocessed {} chunk(s), {} byte(s), {} source file(s)",
        spans.len(),
        text.len(),
        pp.src_file_paths.len()
    );
    Ok(Preprocessed {
        store: pp.store,
        head: all,
        source: text,
        spans,
        src_file_paths: pp.src_file_paths,
    })
}

/// What a `run` invocation is parsing, deciding its termination contract.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Action {
    /// The first, non-recursive call. Returns at end of file only.
    Begin,
    /// An included file.
    Include,
    /// An included `.lyx` file.
    IncludeLyx,
    /// Code between conditional directives. Returns at `` `else ``,
    /// `` `elifdef ``, `` `elifndef `` or `` `endif ``.
    ConditionalBlock,
    /// Code between `` `foreach `` and `` `endfor ``.
    ForeachBlock,
    /// One argument of a function-like macro invocation. Returns on `)` or
    /// `,` at parenthesis depth zero.
    MacroArgument,
    /// An object-like macro body. Returns at the newline.
    ObjectLikeBody,
    /// A function-like macro body. Returns at `` `enddef ``.
    FunctionLikeBody,
}

impl Action {
    fn is_body_definition(self) -> bool {
        matches!(self, Action::ObjectLikeBody | Action::FunctionLikeBody)
    }
}

/// Why a `run` invocation returned. Directive terminators are consumed.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Terminator {
    Eof,
    Newline,
    EndDef,
    Else,
    ElifDef,
    ElifNdef,
    EndIf,
    EndFor,
    /// `)` or `,` at depth zero; the delimiter is left unconsumed.
    Delim,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum UseSite {
    File,
    Line,
    Copy,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum SkippedTo {
    Else,
    ElifDef,
    ElifNdef,
    EndIf,
    Eof,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum ModulePart {
    /// A plain file include.
    Plain,
    /// The `<dir>/<base>.lyh` half of a module.
    Lyh,
    /// The `<dir>/<base>.lyc` half, wrapped in an export-inference scope.
    Lyc,
}

struct IncludeFrame {
    /// `path:line` of the `` `include `` use site.
    origin: String,
    path: PathBuf,
}

struct Preprocessor<'a> {
    standard_paths: Vec<PathBuf>,
    lyx_append: Option<String>,
    installer: Option<InstallModuleHook<'a>>,
    initial_cwd: PathBuf,
    store: ChunkStore,
    macros: MacroTable,
    /// Ring of chunks for included modules, hoisted before all other
    /// output by the concatenation step.
    module_chunks: Option<ChunkId>,
    already_included_modules: FxHashSet<PathBuf>,
    include_stack: Vec<IncludeFrame>,
    /// Directory of the file currently being preprocessed.
    cwd: PathBuf,
    /// Path of the file currently being preprocessed. Empty for the
    /// driver-synthesized top-level source.
    current_path: PathBuf,
    /// Origin stamped on chunks created from the current region (set while
    /// parsing macro bodies and macro arguments).
    chunk_origin: Option<String>,
    /// Non-zero while a macro body is being defined, at any nesting depth.
    /// FILE/LINE expand only when this is zero.
    defining_depth: u32,
    src_file_paths: Vec<PathBuf>,
}

impl<'a> Preprocessor<'a> {
    // ---- diagnostics -----------------------------------------------------

    fn err_at(&self, scan: &Scanner, offset: usize, message: impl Into<String>) -> Error {
        Error {
            location: Location {
                path: self.current_path.clone(),
                line: scan.line_of(offset),
                column: scan.column_of(offset),
            },
            message: message.into(),
            included_from: self
                .include_stack
                .iter()
                .rev()
                .map(|f| f.origin.clone())
                .collect(),
        }
    }

    fn err_here(&self, scan: &Scanner, message: impl Into<String>) -> Error {
        self.err_at(scan, scan.pos(), message)
    }

    fn scan_err(&self, scan: &Scanner, e: ScanError) -> Error {
        self.err_at(scan, e.offset, e.message)
    }

    // ---- chunk helpers ---------------------------------------------------

    /// Create a chunk for the source span `[start, end)` if it is
    /// non-empty, stamped with the ambient origin.
    fn flush(&mut self, scan: &Scanner, chunks: &mut Option<ChunkId>, start: usize, end: usize) {
        if start >= end {
            return;
        }
        let id = self.store.alloc(
            self.chunk_origin.clone(),
            self.current_path.clone(),
            start,
            scan.line_of(start),
            scan.slice(start, end).to_owned(),
        );
        self.store.push_back(chunks, id);
    }

    /// Chunk whose content is the C-style quoted path of the file being
    /// preprocessed, captured at the use site.
    fn file_chunk(&mut self, scan: &Scanner, chunks: &mut Option<ChunkId>, site: usize) {
        let content = format!("\"{}\"", self.current_path.display());
        let id = self.store.alloc(
            None,
            self.current_path.clone(),
            site,
            scan.line_of(site),
            content,
        );
        self.store.push_back(chunks, id);
    }

    /// Chunk whose content is the decimal line number at the use site.
    fn line_chunk(&mut self, scan: &Scanner, chunks: &mut Option<ChunkId>, site: usize) {
        let line = scan.line_of(site);
        let id = self.store.alloc(
            None,
            self.current_path.clone(),
            site,
            line,
            line.to_string(),
        );
        self.store.push_back(chunks, id);
    }

    /// How a macro body chunk lands at the expansion site: `FILE` and
    /// `LINE` are synthesized from the use site unless a body is still
    /// being defined; everything else is copied verbatim.
    fn use_site_substitution(&self, cid: ChunkId) -> UseSite {
        if self.defining_depth == 0 {
            match self.store.chunk(cid).content.as_str() {
                "FILE" => return UseSite::File,
                "LINE" => return UseSite::Line,
                _ => {}
            }
        }
        UseSite::Copy
    }

    fn duplicate_ring_into(&mut self, src: ChunkId, chunks: &mut Option<ChunkId>) {
        for id in self.store.ring(src) {
            let dup = self.store.duplicate(id);
            self.store.push_back(chunks, dup);
        }
    }

    /// Splice a parsed argument's chunks into a function-like expansion.
    /// Chunks that came out of nested expansions are re-stamped with the
    /// argument provenance and the invocation site, so diagnostics point at
    /// the call rather than at an unrelated definition.
    fn substitute_argument(
        &mut self,
        scan: &Scanner,
        src: ChunkId,
        chunks: &mut Option<ChunkId>,
        arg_origin: &str,
        site: usize,
    ) {
        let line = scan.line_of(site);
        for id in self.store.ring(src) {
            let dup = self.store.duplicate(id);
            if self.store.chunk(dup).origin.as_deref() != Some(arg_origin) {
                let path = self.current_path.clone();
                let c = self.store.chunk_mut(dup);
                c.origin = Some(arg_origin.to_owned());
                c.path = path;
                c.offset = site;
                c.line = line;
            }
            self.store.push_back(chunks, dup);
        }
    }

    fn append_to_tail(&mut self, chunks: &Option<ChunkId>, s: &str) {
        let tail = self.store.last(chunks.expect("ring has a first chunk"));
        self.store.chunk_mut(tail).content.push_str(s);
    }

    // ---- predeclared macros ----------------------------------------------

    fn register_predeclared(&mut self, macros: &[PredeclaredMacro]) {
        for pd in macros {
            let chunk = self
                .store
                .alloc(None, PathBuf::new(), 0, 1, pd.content.clone());
            self.macros.define(Macro {
                kind: MacroKind::Predeclared,
                name: pd.name.clone(),
                origin: "creation of predeclared macros".to_owned(),
                chunks: Some(chunk),
                args: Vec::new(),
                being_defined: false,
                is_local: false,
                cannot_be_undefined: true,
                location_set_when_used: true,
                was_used: false,
            });
        }
    }

    // ---- the per-character loop ------------------------------------------

    fn run(
        &mut self,
        scan: &mut Scanner,
        action: Action,
    ) -> Result<(Option<ChunkId>, Terminator)> {
        let mut chunks: Option<ChunkId> = None;
        let mut in_lyx_code = false;
        let mut open_parens = 0usize;

        // An included file starts with an empty synthetic chunk: for an
        // .lyx file it holds the opening quote of the leading text; for a
        // module .lyc file it later receives the export-scope opener.
        if matches!(action, Action::Include | Action::IncludeLyx) {
            let id = self.store.alloc(
                self.chunk_origin.clone(),
                self.current_path.clone(),
                0,
                1,
                String::new(),
            );
            self.store.push_back(&mut chunks, id);
            if action == Action::IncludeLyx {
                self.store.chunk_mut(id).content.push('"');
            }
        }

        let mut start = scan.pos();
        loop {
            let saved = scan.pos();

            if action == Action::IncludeLyx && !in_lyx_code && !scan.at_eof() {
                if scan.looking_at("<%") || scan.peek() == Some(b'$') {
                    self.lyx_close_literal(scan, &mut chunks, start, saved);
                    if scan.peek() == Some(b'$') {
                        scan.bump();
                        self.lyx_interpolate(scan, &chunks, saved)?;
                        // Reopen the literal for the text that follows.
                        self.append_to_tail(&chunks, "\"");
                    } else {
                        scan.bump_by(2);
                        in_lyx_code = true;
                    }
                    start = scan.pos();
                } else if scan.looking_at("<!") {
                    self.flush(scan, &mut chunks, start, saved);
                    scan.bump_by(2);
                    loop {
                        if scan.at_eof() {
                            scan.set_pos(saved);
                            return Err(self.err_here(scan, "invalid xml comment"));
                        }
                        scan.bump();
                        if scan.looking_at("->") {
                            break;
                        }
                    }
                    scan.bump_by(2);
                    start = scan.pos();
                } else {
                    match scan.peek() {
                        Some(b'\n') => {
                            // Replace the newline by its escape sequence so
                            // spaces following it survive in the literal.
                            self.flush(scan, &mut chunks, start, saved);
                            self.append_to_tail(&chunks, "\\n");
                            scan.bump();
                            start = scan.pos();
                        }
                        Some(b'"') => {
                            self.flush(scan, &mut chunks, start, saved);
                            self.append_to_tail(&chunks, "\\");
                            start = scan.pos();
                            scan.skip_string_constant(true)
                                .map_err(|e| self.scan_err(scan, e))?;
                            let closing = scan.pos() - 1;
                            self.flush(scan, &mut chunks, start, closing);
                            self.append_to_tail(&chunks, "\\");
                            start = closing;
                        }
                        Some(b'\'') => {
                            scan.skip_char_constant(true)
                                .map_err(|e| self.scan_err(scan, e))?;
                        }
                        Some(b'\\') => {
                            self.flush(scan, &mut chunks, start, saved);
                            self.append_to_tail(&chunks, "\\");
                            start = saved;
                            scan.bump();
                        }
                        _ => scan.bump(),
                    }
                }
                continue;
            }

            if in_lyx_code && scan.looking_at("%>") {
                self.flush(scan, &mut chunks, start, saved);
                self.append_to_tail(&chunks, "\"");
                scan.bump_by(2);
                start = scan.pos();
                scan.skip_space();
                in_lyx_code = false;
                continue;
            }

            if let Some(sym) =
                scan.read_symbol(Symbol::UPPER | Symbol::LOWER | Symbol::KEEP_TRAILING_SPACE)
            {
                self.flush(scan, &mut chunks, start, saved);
                self.identifier(scan, &mut chunks, action, saved, sym)?;
                start = scan.pos();
                continue;
            }

            match scan.peek() {
                // Token paste: the underscore is erased and the adjacent
                // chunks concatenate textually.
                Some(b'_') => {
                    self.flush(scan, &mut chunks, start, saved);
                    scan.bump();
                    start = scan.pos();
                }
                Some(b'\n') if action == Action::ObjectLikeBody => {
                    self.flush(scan, &mut chunks, start, saved);
                    return Ok((chunks, Terminator::Newline));
                }
                Some(b'(') if action == Action::MacroArgument => {
                    open_parens += 1;
                    scan.bump();
                    scan.skip_space();
                }
                Some(b')') if action == Action::MacroArgument => {
                    if open_parens == 0 {
                        self.flush(scan, &mut chunks, start, saved);
                        return Ok((chunks, Terminator::Delim));
                    }
                    open_parens -= 1;
                    scan.bump();
                    scan.skip_space();
                }
                Some(b',') if action == Action::MacroArgument => {
                    if open_parens == 0 {
                        self.flush(scan, &mut chunks, start, saved);
                        return Ok((chunks, Terminator::Delim));
                    }
                    scan.bump();
                    scan.skip_space();
                }
                Some(b'#') if action != Action::ObjectLikeBody => {
                    self.flush(scan, &mut chunks, start, saved);
                    self.comment(scan, action)?;
                    start = scan.pos();
                    scan.skip_space();
                }
                Some(b'`') => {
                    self.flush(scan, &mut chunks, start, saved);
                    scan.bump();
                    if let Some(term) = self.directive(scan, &mut chunks, action)? {
                        return Ok((chunks, term));
                    }
                    scan.skip_space_stop_after_newline();
                    start = scan.pos();
                }
                Some(b'"') if action != Action::ObjectLikeBody => {
                    scan.skip_string_constant(true)
                        .map_err(|e| self.scan_err(scan, e))?;
                }
                Some(b'\'') if action != Action::ObjectLikeBody => {
                    scan.skip_char_constant(true)
                        .map_err(|e| self.scan_err(scan, e))?;
                }
                None => {
                    if action == Action::IncludeLyx {
                        if in_lyx_code {
                            scan.reverse_skip_space();
                            return Err(
                                self.err_here(scan, "unexpected end of file; expecting %>")
                            );
                        }
                        self.lyx_close_literal(scan, &mut chunks, start, scan.pos());
                    } else {
                        self.flush(scan, &mut chunks, start, scan.pos());
                    }
                    return Ok((chunks, Terminator::Eof));
                }
                _ => scan.bump(),
            }
        }
    }

    // ---- lyx helpers -----------------------------------------------------

    /// Close the string literal currently being accumulated in `.lyx` text
    /// mode: flush the pending span, append the closing quote and the
    /// configured append. When the literal is empty, chop the dangling
    /// opening quote instead so no empty string (and no append) is
    /// emitted.
    fn lyx_close_literal(
        &mut self,
        scan: &Scanner,
        chunks: &mut Option<ChunkId>,
        start: usize,
        end: usize,
    ) {
        let tail = self.store.last(chunks.expect("lyx ring has a first chunk"));
        let bytes = self.store.chunk(tail).content.as_bytes();
        let at_open_quote = bytes.last() == Some(&b'"')
            && !(bytes.len() > 1 && bytes[bytes.len() - 2] == b'\\');
        if at_open_quote && start >= end {
            let content = &mut self.store.chunk_mut(tail).content;
            content.truncate(content.len() - 1);
            return;
        }
        self.flush(scan, chunks, start, end);
        self.append_to_tail(chunks, "\"");
        if let Some(append) = self.lyx_append.clone() {
            self.append_to_tail(chunks, &append);
        }
    }

    /// `$name` / `${name}` with the cursor just after the `$`.
    fn lyx_interpolate(
        &mut self,
        scan: &mut Scanner,
        chunks: &Option<ChunkId>,
        dollar: usize,
    ) -> Result<()> {
        if scan.peek() == Some(b'{') {
            scan.bump();
            scan.skip_space();
            let Some(sym) = scan.read_symbol(Symbol::UPPER | Symbol::LOWER) else {
                scan.set_pos(dollar + 1);
                return Err(self.err_here(scan, "expecting a symbol"));
            };
            self.append_to_tail(chunks, &sym);
            if scan.peek() != Some(b'}') {
                scan.reverse_skip_space();
                return Err(self.err_here(scan, "expecting '}'"));
            }
            scan.bump();
        } else if let Some(sym) =
            scan.read_symbol(Symbol::UPPER | Symbol::LOWER | Symbol::KEEP_TRAILING_SPACE)
        {
            self.append_to_tail(chunks, &sym);
        } else {
            scan.set_pos(dollar + 1);
            return Err(self.err_here(scan, "expecting a symbol"));
        }
        if let Some(append) = self.lyx_append.clone() {
            self.append_to_tail(chunks, &append);
        }
        Ok(())
    }

    // ---- comments --------------------------------------------------------

    /// `#` with the cursor at the hash: a `#{ … }#` block (nesting, strings
    /// opaque) or a line comment to end of line (not past `%>` in lyx
    /// mode).
    fn comment(&mut self, scan: &mut Scanner, action: Action) -> Result<()> {
        let hash = scan.pos();
        scan.bump();
        if scan.peek() == Some(b'{') {
            let mut depth = 0usize;
            scan.bump();
            loop {
                match scan.peek() {
                    None => {
                        scan.set_pos(hash);
                        return Err(
                            self.err_here(scan, "corresponding \"}#\" could not be found")
                        );
                    }
                    Some(b'#') => {
                        scan.bump();
                        if scan.peek() == Some(b'{') {
                            scan.bump();
                            depth += 1;
                        } else {
                            while !matches!(scan.peek(), None | Some(b'\n')) {
                                scan.bump();
                            }
                        }
                    }
                    Some(b'}') => {
                        scan.bump();
                        if scan.peek() == Some(b'#') {
                            scan.bump();
                            if depth == 0 {
                                break;
                            }
                            depth -= 1;
                        }
                    }
                    Some(b'"') => {
                        scan.skip_string_constant(true)
                            .map_err(|e| self.scan_err(scan, e))?;
                    }
                    Some(b'\'') => {
                        scan.skip_char_constant(true)
                            .map_err(|e| self.scan_err(scan, e))?;
                    }
                    _ => scan.bump(),
                }
            }
        } else {
            while let Some(c) = scan.peek() {
                if c == b'\n' || (action == Action::IncludeLyx && scan.looking_at("%>")) {
                    break;
                }
                scan.bump();
            }
        }
        Ok(())
    }

    // ---- identifiers and macro expansion ---------------------------------

    fn identifier(
        &mut self,
        scan: &mut Scanner,
        chunks: &mut Option<ChunkId>,
        action: Action,
        site: usize,
        sym: String,
    ) -> Result<()> {
        if (sym == "FILE" || sym == "LINE") && self.defining_depth == 0 {
            if sym == "FILE" {
                self.file_chunk(scan, chunks, site);
            } else {
                self.line_chunk(scan, chunks, site);
            }
            return Ok(());
        }
        let Some(mid) = self.macros.lookup(&sym) else {
            // An ordinary identifier becomes its own chunk so adjacent
            // token pastes concatenate cleanly.
            self.flush(scan, chunks, site, scan.pos());
            return Ok(());
        };
        if self.macros.get(mid).being_defined {
            scan.set_pos(site);
            return Err(self.err_here(scan, "a macro that is being defined cannot be used"));
        }
        if self.macros.get(mid).kind == MacroKind::Function {
            self.expand_function_like(scan, chunks, action, mid, site)
        } else {
            self.expand_object_like(scan, chunks, mid, site);
            Ok(())
        }
    }

    fn expand_object_like(
        &mut self,
        scan: &Scanner,
        chunks: &mut Option<ChunkId>,
        mid: MacroId,
        site: usize,
    ) {
        self.macros.get_mut(mid).was_used = true;
        let Some(body) = self.macros.get(mid).chunks else {
            return;
        };
        for cid in self.store.ring(body) {
            match self.use_site_substitution(cid) {
                UseSite::File => self.file_chunk(scan, chunks, site),
                UseSite::Line => self.line_chunk(scan, chunks, site),
                UseSite::Copy => {
                    let dup = self.store.duplicate(cid);
                    self.store.push_back(chunks, dup);
                }
            }
        }
        // Predeclared and loop macros have a single chunk whose provenance
        // borrows from the use site.
        if self.macros.get(mid).location_set_when_used {
            let name = self.macros.get(mid).name.clone();
            let last = self.store.last(chunks.expect("expansion produced a chunk"));
            let line = scan.line_of(site);
            let path = self.current_path.clone();
            let c = self.store.chunk_mut(last);
            c.origin = Some(format!("from macro \"{name}\""));
            c.path = path;
            c.offset = site;
            c.line = line;
        }
    }

    fn expand_function_like(
        &mut self,
        scan: &mut Scanner,
        chunks: &mut Option<ChunkId>,
        _action: Action,
        mid: MacroId,
        site: usize,
    ) -> Result<()> {
        scan.skip_space();
        if scan.peek() != Some(b'(') {
            scan.set_pos(site);
            return Err(self.err_here(scan, "function-like macro not followed by '('"));
        }
        scan.bump();
        scan.skip_space();

        let args = self.macros.get(mid).args.clone();
        let mname = self.macros.get(mid).name.clone();
        let mut parsed: Vec<Option<ChunkId>> = Vec::with_capacity(args.len());
        let saved_origin = self.chunk_origin.take();
        for (i, &arg) in args.iter().enumerate() {
            let aname = self.macros.get(arg).name.clone();
            self.chunk_origin = Some(format!(
                "from argument \"{aname}\" of macro \"{mname}\""
            ));
            let (head, term) = self.run(scan, Action::MacroArgument)?;
            if term == Terminator::Eof {
                scan.reverse_skip_space();
                return Err(self.err_here(
                    scan,
                    "unexpected end of file while invoking function-like macro",
                ));
            }
            parsed.push(head);
            if i + 1 < args.len() {
                if scan.peek() != Some(b',') {
                    return Err(self.err_here(scan, "expecting ','"));
                }
                scan.bump();
                scan.skip_space();
            } else {
                if scan.peek() != Some(b')') {
                    return Err(self.err_here(scan, "expecting ')'"));
                }
                scan.bump();
            }
        }
        self.chunk_origin = saved_origin;

        // Substitute: a body chunk whose origin is null and whose content
        // equals an argument name is the unique substitution sentinel.
        // After a macro's definition, the only expansion done within its
        // body is FILE/LINE and its arguments; everything else resolves at
        // the final expansion site.
        let body = self
            .macros
            .get(mid)
            .chunks
            .expect("function-like macro body always has chunks");
        for cid in self.store.ring(body) {
            let arg_index = {
                let c = self.store.chunk(cid);
                if c.origin.is_none() {
                    let content = c.content.as_str();
                    args.iter()
                        .position(|&a| self.macros.get(a).name == content)
                } else {
                    None
                }
            };
            if let Some(ai) = arg_index {
                if let Some(h) = parsed[ai] {
                    let aname = self.macros.get(args[ai]).name.clone();
                    let arg_origin =
                        format!("from argument \"{aname}\" of macro \"{mname}\"");
                    self.substitute_argument(scan, h, chunks, &arg_origin, site);
                }
                continue;
            }
            match self.use_site_substitution(cid) {
                UseSite::File => self.file_chunk(scan, chunks, site),
                UseSite::Line => self.line_chunk(scan, chunks, site),
                UseSite::Copy => {
                    let dup = self.store.duplicate(cid);
                    self.store.push_back(chunks, dup);
                }
            }
        }
        Ok(())
    }

    // ---- directives ------------------------------------------------------

    /// Dispatch a backtick directive with the cursor just after the
    /// backtick. Returns a terminator when the directive ends the current
    /// `run`.
    fn directive(
        &mut self,
        scan: &mut Scanner,
        chunks: &mut Option<ChunkId>,
        action: Action,
    ) -> Result<Option<Terminator>> {
        let dstart = scan.pos();
        if scan.check_for_directive("include") {
            if action.is_body_definition() {
                return Err(self.err_at(scan, dstart, "invalid use of preprocessor directive"));
            }
            self.handle_include(scan, chunks, action)?;
            Ok(None)
        } else if scan.check_for_directive("define") {
            if action.is_body_definition() {
                return Err(self.err_at(scan, dstart, "invalid use of preprocessor directive"));
            }
            self.handle_define(scan, dstart, false)?;
            Ok(None)
        } else if scan.check_for_directive("locdef") {
            if action.is_body_definition() {
                return Err(self.err_at(scan, dstart, "invalid use of preprocessor directive"));
            }
            self.handle_define(scan, dstart, true)?;
            Ok(None)
        } else if scan.check_for_directive("enddef") {
            if action != Action::FunctionLikeBody {
                return Err(self.err_at(scan, dstart, "invalid use of preprocessor directive"));
            }
            Ok(Some(Terminator::EndDef))
        } else if scan.check_for_directive("undef") {
            if action.is_body_definition() {
                return Err(self.err_at(scan, dstart, "invalid use of preprocessor directive"));
            }
            self.handle_undef(scan, action)?;
            Ok(None)
        } else if scan.check_for_directive("ifdef") {
            if action == Action::ObjectLikeBody {
                return Err(self.err_at(scan, dstart, "invalid use of preprocessor directive"));
            }
            self.handle_conditional(scan, chunks, false, dstart)?;
            Ok(None)
        } else if scan.check_for_directive("ifndef") {
            if action == Action::ObjectLikeBody {
                return Err(self.err_at(scan, dstart, "invalid use of preprocessor directive"));
            }
            self.handle_conditional(scan, chunks, true, dstart)?;
            Ok(None)
        } else if scan.check_for_directive("elifdef") {
            if action != Action::ConditionalBlock {
                return Err(self.err_at(scan, dstart, "invalid use of preprocessor directive"));
            }
            Ok(Some(Terminator::ElifDef))
        } else if scan.check_for_directive("elifndef") {
            if action != Action::ConditionalBlock {
                return Err(self.err_at(scan, dstart, "invalid use of preprocessor directive"));
            }
            Ok(Some(Terminator::ElifNdef))
        } else if scan.check_for_directive("else") {
            if action != Action::ConditionalBlock {
                return Err(self.err_at(scan, dstart, "invalid use of preprocessor directive"));
            }
            Ok(Some(Terminator::Else))
        } else if scan.check_for_directive("endif") {
            if action != Action::ConditionalBlock {
                return Err(self.err_at(scan, dstart, "invalid use of preprocessor directive"));
            }
            Ok(Some(Terminator::EndIf))
        } else if scan.check_for_directive("foreach") {
            if action == Action::ObjectLikeBody {
                return Err(self.err_at(scan, dstart, "invalid use of preprocessor directive"));
            }
            self.handle_foreach(scan, chunks, dstart)?;
            Ok(None)
        } else if scan.check_for_directive("endfor") {
            if action != Action::ForeachBlock {
                return Err(self.err_at(scan, dstart, "invalid use of preprocessor directive"));
            }
            Ok(Some(Terminator::EndFor))
        } else if scan.check_for_directive("abort") {
            // The error site itself is the diagnostic.
            Err(self.err_at(scan, dstart, ""))
        } else {
            Err(self.err_at(scan, dstart, "expecting a valid preprocessor directive"))
        }
    }

    // ---- `define / `locdef -----------------------------------------------

    fn handle_define(&mut self, scan: &mut Scanner, dstart: usize, local: bool) -> Result<()> {
        scan.skip_inline_space();
        let name_pos = scan.pos();
        let Some(name) =
            scan.read_symbol(Symbol::UPPER | Symbol::LOWER | Symbol::KEEP_TRAILING_SPACE)
        else {
            return Err(self.err_at(scan, name_pos, "expecting a valid macro name"));
        };
        if name == "FILE" || name == "LINE" {
            return Err(self.err_at(scan, name_pos, "reserved macro name"));
        }
        if let Some(existing) = self.macros.lookup(&name) {
            let origin = self.macros.get(existing).origin.clone();
            return Err(self.err_at(
                scan,
                name_pos,
                format!("macro was already declared at {origin}"),
            ));
        }
        let origin = format!(
            "{}:{}",
            self.current_path.display(),
            scan.line_of(name_pos)
        );
        log::trace!("defining macro {name} at {origin}");

        if scan.peek() == Some(b'(') {
            self.define_function_like(scan, dstart, name, origin, local)
        } else {
            self.define_object_like(scan, name_pos, name, origin, local)
        }
    }

    fn define_object_like(
        &mut self,
        scan: &mut Scanner,
        name_pos: usize,
        name: String,
        origin: String,
        local: bool,
    ) -> Result<()> {
        if name.as_bytes()[0].is_ascii_lowercase() {
            return Err(self.err_at(
                scan,
                name_pos,
                "expecting an object-like macro name that do not use lowercase characters",
            ));
        }
        scan.skip_inline_space();
        let mid = self.macros.define(Macro {
            kind: MacroKind::Object,
            name: name.clone(),
            origin,
            chunks: None,
            args: Vec::new(),
            being_defined: true,
            is_local: local,
            cannot_be_undefined: false,
            location_set_when_used: false,
            was_used: false,
        });
        let saved_origin = std::mem::replace(
            &mut self.chunk_origin,
            Some(format!("from macro \"{name}\"")),
        );
        self.defining_depth += 1;
        let result = self.run(scan, Action::ObjectLikeBody);
        self.defining_depth -= 1;
        self.chunk_origin = saved_origin;
        let (body, _term) = result?;
        let m = self.macros.get_mut(mid);
        m.chunks = body;
        m.being_defined = false;
        Ok(())
    }

    fn define_function_like(
        &mut self,
        scan: &mut Scanner,
        dstart: usize,
        name: String,
        origin: String,
        local: bool,
    ) -> Result<()> {
        let mut args: Vec<MacroId> = Vec::new();
        let mut arg_sites: Vec<usize> = Vec::new();
        loop {
            scan.bump(); // '(' on the first round, ',' afterwards
            scan.skip_inline_space();
            let apos = scan.pos();
            let Some(aname) = scan.read_symbol(Symbol::UPPER | Symbol::KEEP_TRAILING_SPACE)
            else {
                return Err(self.err_at(
                    scan,
                    apos,
                    "expecting a macro argument name that do not use lowercase characters",
                ));
            };
            if aname == name {
                return Err(self.err_at(
                    scan,
                    apos,
                    "macro argument name has the same name as its owner",
                ));
            }
            if aname == "FILE" || aname == "LINE" {
                return Err(self.err_at(scan, apos, "reserved macro name"));
            }
            if let Some(clash) = self.macros.lookup(&aname) {
                let clash_origin = self.macros.get(clash).origin.clone();
                return Err(self.err_at(
                    scan,
                    apos,
                    format!(
                        "macro argument name was already used to declare a macro at {clash_origin}"
                    ),
                ));
            }
            if args.iter().any(|&a| self.macros.get(a).name == aname) {
                return Err(self.err_at(scan, apos, "macro argument name already used"));
            }
            // The argument's single chunk is the substitution sentinel:
            // origin is null and the content is the argument's own name.
            let sentinel = self.store.alloc(None, PathBuf::new(), 0, 1, aname.clone());
            let aid = self.macros.alloc_hidden(Macro {
                kind: MacroKind::Argument,
                name: aname,
                origin: origin.clone(),
                chunks: Some(sentinel),
                args: Vec::new(),
                being_defined: false,
                is_local: false,
                cannot_be_undefined: true,
                location_set_when_used: false,
                was_used: false,
            });
            args.push(aid);
            arg_sites.push(apos);
            scan.skip_inline_space();
            if scan.peek() != Some(b',') {
                break;
            }
        }
        if scan.peek() != Some(b')') {
            return Err(self.err_here(scan, "expecting ',' or ')'"));
        }
        scan.bump();
        scan.skip_inline_space();
        if scan.peek() != Some(b'\n') {
            scan.reverse_skip_space();
            return Err(self.err_here(scan, "expecting newline"));
        }
        scan.bump();

        let mid = self.macros.define(Macro {
            kind: MacroKind::Function,
            name: name.clone(),
            origin,
            chunks: None,
            args: args.clone(),
            being_defined: true,
            is_local: local,
            cannot_be_undefined: false,
            location_set_when_used: false,
            was_used: false,
        });
        for &a in &args {
            self.macros.push(a);
        }
        let saved_origin = std::mem::replace(
            &mut self.chunk_origin,
            Some(format!("from macro \"{name}\"")),
        );
        self.defining_depth += 1;
        let result = self.run(scan, Action::FunctionLikeBody);
        self.defining_depth -= 1;
        self.chunk_origin = saved_origin;
        let (body, term) = result?;
        if term != Terminator::EndDef {
            return Err(self.err_at(scan, dstart, "corresponding `enddef could not be found"));
        }
        for (i, &a) in args.iter().enumerate() {
            self.macros.remove(a);
            if !self.macros.get(a).was_used {
                return Err(self.err_at(scan, arg_sites[i], "unused macro argument"));
            }
        }
        let m = self.macros.get_mut(mid);
        m.chunks = body;
        m.being_defined = false;
        Ok(())
    }

    // ---- `undef ----------------------------------------------------------

    fn handle_undef(&mut self, scan: &mut Scanner, action: Action) -> Result<()> {
        scan.skip_inline_space();
        loop {
            let saved = scan.pos();
            let Some(name) =
                scan.read_symbol(Symbol::UPPER | Symbol::LOWER | Symbol::KEEP_TRAILING_SPACE)
            else {
                return Err(self.err_at(scan, saved, "expecting a macro name"));
            };
            match self.macros.lookup(&name) {
                None => {
                    return Err(self.err_at(scan, saved, "macro was not previously defined"));
                }
                Some(id) => {
                    if self.macros.get(id).cannot_be_undefined {
                        return Err(self.err_at(scan, saved, "macro cannot be undefined"));
                    }
                    if self.macros.get(id).being_defined {
                        return Err(self.err_at(
                            scan,
                            saved,
                            "a macro that is being defined cannot be used",
                        ));
                    }
                    self.macros.remove(id);
                }
            }
            scan.skip_inline_space();
            match scan.peek() {
                None | Some(b'\n') => break,
                Some(b'%') if action == Action::IncludeLyx && scan.peek_at(1) == Some(b'>') => {
                    break;
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ---- conditionals ----------------------------------------------------

    /// `` `ifdef `` / `` `ifndef `` and their `` `elif* `` re-entries,
    /// driven as a loop instead of the original's cross-handler gotos.
    fn handle_conditional(
        &mut self,
        scan: &mut Scanner,
        chunks: &mut Option<ChunkId>,
        negate_first: bool,
        dstart: usize,
    ) -> Result<()> {
        let mut negate = negate_first;
        loop {
            scan.skip_inline_space();
            let saved = scan.pos();
            let Some(name) =
                scan.read_symbol(Symbol::UPPER | Symbol::LOWER | Symbol::KEEP_TRAILING_SPACE)
            else {
                return Err(self.err_at(scan, saved, "expecting a macro name"));
            };
            let defined = match self.macros.lookup(&name) {
                Some(id) if self.macros.get(id).being_defined => {
                    return Err(self.err_at(
                        scan,
                        saved,
                        "a macro that is being defined cannot be used",
                    ));
                }
                Some(_) => true,
                None => false,
            };
            scan.skip_space();

            if defined != negate {
                // Taken branch: parse it, then skip everything up to the
                // matching endif.
                let (head, term) = self.run(scan, Action::ConditionalBlock)?;
                if let Some(h) = head {
                    self.store.attach(chunks, h);
                }
                match term {
                    Terminator::Eof => return Err(self.missing_endif(scan, dstart)),
                    Terminator::EndIf => return Ok(()),
                    _ => loop {
                        match self.skip_conditional_block(scan)? {
                            SkippedTo::Eof => return Err(self.missing_endif(scan, dstart)),
                            SkippedTo::EndIf => return Ok(()),
                            _ => {}
                        }
                    },
                }
            } else {
                match self.skip_conditional_block(scan)? {
                    SkippedTo::Eof => return Err(self.missing_endif(scan, dstart)),
                    SkippedTo::ElifDef => {
                        negate = false;
                    }
                    SkippedTo::ElifNdef => {
                        negate = true;
                    }
                    SkippedTo::EndIf => return Ok(()),
                    SkippedTo::Else => {
                        let (head, term) = self.run(scan, Action::ConditionalBlock)?;
                        if let Some(h) = head {
                            self.store.attach(chunks, h);
                        }
                        return match term {
                            Terminator::EndIf => Ok(()),
                            Terminator::Eof => Err(self.missing_endif(scan, dstart)),
                            _ => Err(self.err_here(scan, "expecting `endif")),
                        };
                    }
                }
            }
        }
    }

    fn missing_endif(&self, scan: &Scanner, dstart: usize) -> Error {
        self.err_at(scan, dstart, "corresponding `endif could not be found")
    }

    /// Skip code until a conditional terminator at the current nesting
    /// depth, without consuming chunks. Strings and char literals are
    /// opaque; nested `if*` openers are counted.
    fn skip_conditional_block(&mut self, scan: &mut Scanner) -> Result<SkippedTo> {
        let mut depth = 0usize;
        loop {
            match scan.peek() {
                None => return Ok(SkippedTo::Eof),
                Some(b'#') => {
                    while !matches!(scan.peek(), None | Some(b'\n')) {
                        scan.bump();
                    }
                }
                Some(b'`') => {
                    scan.bump();
                    if scan.check_for_directive("ifdef") || scan.check_for_directive("ifndef") {
                        depth += 1;
                    } else if scan.check_for_directive("elifdef") {
                        if depth == 0 {
                            return Ok(SkippedTo::ElifDef);
                        }
                    } else if scan.check_for_directive("elifndef") {
                        if depth == 0 {
                            return Ok(SkippedTo::ElifNdef);
                        }
                    } else if scan.check_for_directive("else") {
                        if depth == 0 {
                            return Ok(SkippedTo::Else);
                        }
                    } else if scan.check_for_directive("endif") {
                        if depth == 0 {
                            return Ok(SkippedTo::EndIf);
                        }
                        depth -= 1;
                    }
                }
                Some(b'"') => {
                    scan.skip_string_constant(true)
                        .map_err(|e| self.scan_err(scan, e))?;
                }
                Some(b'\'') => {
                    scan.skip_char_constant(true)
                        .map_err(|e| self.scan_err(scan, e))?;
                }
                _ => scan.bump(),
            }
        }
    }

    // ---- `foreach --------------------------------------------------------

    fn handle_foreach(
        &mut self,
        scan: &mut Scanner,
        chunks: &mut Option<ChunkId>,
        dstart: usize,
    ) -> Result<()> {
        scan.skip_inline_space();
        let name_pos = scan.pos();
        let Some(name) = scan.read_symbol(Symbol::UPPER | Symbol::KEEP_TRAILING_SPACE) else {
            return Err(self.err_at(
                scan,
                name_pos,
                "expecting a macro name that do not use lowercase characters",
            ));
        };
        if name == "FILE" || name == "LINE" {
            return Err(self.err_at(scan, name_pos, "reserved macro name"));
        }
        if let Some(existing) = self.macros.lookup(&name) {
            let origin = self.macros.get(existing).origin.clone();
            return Err(self.err_at(
                scan,
                name_pos,
                format!("macro was already declared at {origin}"),
            ));
        }
        let origin = format!(
            "{}:{}",
            self.current_path.display(),
            scan.line_of(name_pos)
        );

        // One or more double-quoted iteration values, then a newline.
        let mut params: Vec<String> = Vec::new();
        loop {
            let saved = scan.pos();
            scan.skip_inline_space();
            match scan.peek() {
                Some(b'\n') => {
                    if params.is_empty() {
                        scan.set_pos(saved);
                        return Err(self.err_here(scan, "expecting a double quoted string"));
                    }
                    scan.bump();
                    break;
                }
                Some(b'"') => {
                    let value_pos = scan.pos();
                    let s = scan
                        .read_string_constant(StringMode::Raw)
                        .map_err(|e| self.scan_err(scan, e))?;
                    if s.is_empty() {
                        return Err(self.err_at(scan, value_pos, "empty string"));
                    }
                    params.push(s);
                }
                _ => {
                    scan.set_pos(saved);
                    return Err(
                        self.err_here(scan, "expecting a double quoted string or a newline")
                    );
                }
            }
        }

        // The loop macro has a single chunk whose content is aliased to
        // each iteration value in turn; provenance is stamped at each use
        // site.
        let body_chunk = self.store.alloc(None, PathBuf::new(), 0, 1, String::new());
        let mid = self.macros.define(Macro {
            kind: MacroKind::Loop,
            name,
            origin,
            chunks: Some(body_chunk),
            args: Vec::new(),
            being_defined: false,
            is_local: false,
            cannot_be_undefined: true,
            location_set_when_used: true,
            was_used: false,
        });

        let body_start = scan.pos();
        for param in &params {
            self.store.chunk_mut(body_chunk).content = param.clone();
            scan.set_pos(body_start);
            let (head, term) = self.run(scan, Action::ForeachBlock)?;
            if term == Terminator::Eof {
                return Err(self.err_at(
                    scan,
                    dstart,
                    "corresponding `endfor could not be found",
                ));
            }
            if let Some(h) = head {
                self.store.attach(chunks, h);
            }
        }
        if !self.macros.get(mid).was_used {
            return Err(self.err_at(scan, name_pos, "unused for-loop macro"));
        }
        self.macros.remove(mid);
        Ok(())
    }

    // ---- `include --------------------------------------------------------

    fn handle_include(
        &mut self,
        scan: &mut Scanner,
        chunks: &mut Option<ChunkId>,
        action: Action,
    ) -> Result<()> {
        scan.skip_inline_space();
        loop {
            let site = scan.pos();
            if scan.peek() != Some(b'"') {
                return Err(self.err_at(
                    scan,
                    site,
                    "expecting a double-quoted module/file path",
                ));
            }
            let filepath = scan
                .read_string_constant(StringMode::Raw)
                .map_err(|e| self.scan_err(scan, e))?;
            if filepath.is_empty() {
                return Err(self.err_at(scan, site, "expecting a module/file path"));
            }
            self.include_one(scan, chunks, site, &filepath)?;
            scan.skip_inline_space();
            match scan.peek() {
                None | Some(b'\n') => break,
                Some(b'%') if action == Action::IncludeLyx && scan.peek_at(1) == Some(b'>') => {
                    break;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Resolve one include path. `/`-anchored and `./`/`../` paths resolve
    /// against the filesystem root and the including file's directory;
    /// everything else is searched in the standard paths, with one
    /// installer retry. A directory target is a module include.
    fn include_one(
        &mut self,
        scan: &mut Scanner,
        chunks: &mut Option<ChunkId>,
        site: usize,
        filepath: &str,
    ) -> Result<()> {
        let anchored = if filepath.starts_with('/') {
            Some(PathBuf::from(filepath))
        } else if filepath.starts_with("./") || filepath.starts_with("../") {
            Some(self.cwd.join(filepath))
        } else {
            None
        };
        if let Some(candidate) = anchored {
            return if candidate.is_dir() {
                self.include_module(scan, chunks, site, &candidate)
            } else {
                self.include_file(scan, chunks, site, &candidate, ModulePart::Plain)
            };
        }

        let mut retried = false;
        loop {
            for sp in self.standard_paths.clone() {
                let base = if sp.is_absolute() {
                    sp
                } else {
                    self.initial_cwd.join(sp)
                };
                let candidate = base.join(filepath);
                if candidate.is_dir() {
                    return self.include_module(scan, chunks, site, &candidate);
                }
                if candidate.is_file() {
                    return self.include_file(scan, chunks, site, &candidate, ModulePart::Plain);
                }
            }
            if !retried {
                retried = true;
                if let Some(installer) = self.installer.as_mut() {
                    log::debug!("module {filepath} not found, invoking installer");
                    if installer(filepath) {
                        continue;
                    }
                }
            }
            return Err(self.err_at(scan, site, "could not include"));
        }
    }

    fn include_module(
        &mut self,
        scan: &mut Scanner,
        chunks: &mut Option<ChunkId>,
        site: usize,
        dir: &Path,
    ) -> Result<()> {
        let abs = if dir.is_absolute() {
            dir.to_owned()
        } else {
            self.initial_cwd.join(dir)
        };
        let canon = std::fs::canonicalize(&abs).unwrap_or(abs);
        if self.already_included_modules.contains(&canon) {
            log::trace!("module {} already included", canon.display());
            return Ok(());
        }
        let base = canon
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let lyh = canon.join(format!("{base}.lyh"));
        self.include_file(scan, chunks, site, &lyh, ModulePart::Lyh)?;
        self.already_included_modules.insert(canon.clone());
        let lyc = canon.join(format!("{base}.lyc"));
        if lyc.is_file() {
            self.include_file(scan, chunks, site, &lyc, ModulePart::Lyc)?;
        }
        Ok(())
    }

    fn include_file(
        &mut self,
        scan: &mut Scanner,
        chunks: &mut Option<ChunkId>,
        site: usize,
        path: &Path,
        part: ModulePart,
    ) -> Result<()> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| self.err_at(scan, site, "could not include"))?;
        let is_lyx = path.extension().is_some_and(|e| e == "lyx");
        let abs = if path.is_absolute() {
            path.to_owned()
        } else {
            self.initial_cwd.join(path)
        };
        let canon = std::fs::canonicalize(&abs).unwrap_or(abs);
        self.src_file_paths.push(canon.clone());
        if self.include_stack.iter().any(|f| f.path == canon) {
            return Err(self.err_at(scan, site, "recursive include"));
        }
        log::debug!("including {}", canon.display());
        let origin = format!("{}:{}", self.current_path.display(), scan.line_of(site));
        self.include_stack.push(IncludeFrame {
            origin,
            path: canon.clone(),
        });
        let saved_cwd = std::mem::replace(
            &mut self.cwd,
            canon.parent().map(Path::to_owned).unwrap_or_default(),
        );
        let saved_path = std::mem::replace(&mut self.current_path, canon);
        let watermark = self.macros.watermark();

        let mut sub = Scanner::new(&content);
        let result = self.run(
            &mut sub,
            if is_lyx {
                Action::IncludeLyx
            } else {
                Action::Include
            },
        );

        // Locally defined macros are not visible outside their file; the
        // frame state is restored on both return paths.
        self.macros.remove_locals_since(watermark);
        self.current_path = saved_path;
        self.cwd = saved_cwd;
        self.include_stack.pop();
        let (head, _term) = result?;

        if let Some(h) = head {
            let last = self.store.last(h);
            self.store.chunk_mut(last).first = Some(h);
            if part == ModulePart::Lyc {
                self.store.chunk_mut(h).content.push_str(EXPORT_SCOPE_OPEN);
                let last = self.store.last(h);
                self.store
                    .chunk_mut(last)
                    .content
                    .push_str(EXPORT_SCOPE_CLOSE);
            }
            match part {
                ModulePart::Plain => self.store.attach(chunks, h),
                ModulePart::Lyh | ModulePart::Lyc => {
                    let mut mc = self.module_chunks;
                    self.store.attach(&mut mc, h);
                    self.module_chunks = mc;
                }
            }
        }
        Ok(())
    }
}
