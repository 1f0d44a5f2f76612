//! Reference front-end.
//!
//! The full expression parser and type system are external collaborators
//! of the compile core; this front-end drives the pipeline end-to-end with
//! a deliberately small statement language over native-typed variables:
//! declarations (optionally `volatile`), assignments and compound
//! assignments, `++`/`--`, operator expressions and `return`. It runs the
//! two-pass protocol the emitters assume: the first pass only materializes
//! result variables, the second emits IR.

use std::collections::HashMap;

use lyrical_codegen::ir::{DebugInfo, Opcode, Reg};
use lyrical_codegen::{
    native_operator, CallArgs, CodegenError, CompileResult, Cx, EmitConfig, OpArg, Pass,
    Program, Type, Var,
};

/// Maps a byte offset of the preprocessed source to the debug provenance
/// stamped on the instructions generated from it.
pub type SrcLookup<'a> = &'a dyn Fn(usize) -> DebugInfo;

#[derive(Debug, thiserror::Error)]
pub enum FrontendError {
    #[error("line {line}: {message}")]
    Parse { line: u32, message: String },
    #[error("line {line}: unknown variable '{name}'")]
    UnknownVariable { line: u32, name: String },
    #[error("line {line}: variable '{name}' is already declared")]
    DuplicateVariable { line: u32, name: String },
    #[error(transparent)]
    Codegen(#[from] CodegenError),
}

type FrontResult<T> = Result<T, FrontendError>;

// ---- AST -----------------------------------------------------------------

#[derive(Debug)]
enum Expr {
    Num(i64),
    Var(String, u32),
    Unary(&'static str, Box<Expr>),
    Binary(&'static str, Box<Expr>, Box<Expr>),
}

#[derive(Debug)]
enum Stmt {
    Decl {
        volatile: bool,
        ty: Type,
        name: String,
        init: Option<Expr>,
        line: u32,
        at: usize,
    },
    Assign {
        name: String,
        op: &'static str,
        value: Expr,
        line: u32,
        at: usize,
    },
    IncDec {
        name: String,
        op: &'static str,
        line: u32,
        at: usize,
    },
    Return {
        value: Expr,
        at: usize,
    },
}

impl Stmt {
    fn at(&self) -> usize {
        match self {
            Stmt::Decl { at, .. }
            | Stmt::Assign { at, .. }
            | Stmt::IncDec { at, .. }
            | Stmt::Return { at, .. } => *at,
        }
    }
}

// ---- lexer ---------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Ident(String),
    Num(i64),
    Punct(&'static str),
}

const PUNCTS: &[&str] = &[
    "<<=", ">>=", "==", "!=", "<=", ">=", "<<", ">>", "++", "--", "+=", "-=", "*=", "/=",
    "%=", "&=", "|=", "^=", "=", "+", "-", "*", "/", "%", "&", "|", "^", "~", "!", "?",
    "<", ">", "(", ")", ";",
];

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
        }
    }

    fn err(&self, message: impl Into<String>) -> FrontendError {
        FrontendError::Parse {
            line: self.line,
            message: message.into(),
        }
    }

    fn next(&mut self) -> FrontResult<Option<(Tok, u32, usize)>> {
        loop {
            match self.src.get(self.pos) {
                None => return Ok(None),
                Some(b'\n') => {
                    self.line += 1;
                    self.pos += 1;
                }
                Some(c) if c.is_ascii_whitespace() => self.pos += 1,
                _ => break,
            }
        }
        let line = self.line;
        let at = self.pos;
        let c = self.src[self.pos];
        if c.is_ascii_alphabetic() {
            let start = self.pos;
            while self
                .src
                .get(self.pos)
                .is_some_and(u8::is_ascii_alphanumeric)
            {
                self.pos += 1;
            }
            let text = core::str::from_utf8(&self.src[start..self.pos]).unwrap();
            return Ok(Some((Tok::Ident(text.to_owned()), line, at)));
        }
        if c.is_ascii_digit() {
            let start = self.pos;
            while self.src.get(self.pos).is_some_and(u8::is_ascii_digit) {
                self.pos += 1;
            }
            let text = core::str::from_utf8(&self.src[start..self.pos]).unwrap();
            let value: i64 = text
                .parse()
                .map_err(|_| self.err(format!("invalid number '{text}'")))?;
            return Ok(Some((Tok::Num(value), line, at)));
        }
        for p in PUNCTS {
            if self.src[self.pos..].starts_with(p.as_bytes()) {
                self.pos += p.len();
                return Ok(Some((Tok::Punct(p), line, at)));
            }
        }
        Err(self.err(format!("unexpected character '{}'", c as char)))
    }
}

// ---- parser --------------------------------------------------------------

struct Parser {
    toks: Vec<(Tok, u32, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|(t, _, _)| t)
    }

    fn line(&self) -> u32 {
        self.toks
            .get(self.pos.min(self.toks.len().saturating_sub(1)))
            .map_or(0, |&(_, l, _)| l)
    }

    fn offset(&self) -> usize {
        self.toks
            .get(self.pos.min(self.toks.len().saturating_sub(1)))
            .map_or(0, |&(_, _, o)| o)
    }

    fn bump(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).map(|(t, _, _)| t.clone());
        self.pos += 1;
        t
    }

    fn err(&self, message: impl Into<String>) -> FrontendError {
        FrontendError::Parse {
            line: self.line(),
            message: message.into(),
        }
    }

    fn expect_punct(&mut self, p: &'static str) -> FrontResult<()> {
        match self.bump() {
            Some(Tok::Punct(q)) if q == p => Ok(()),
            _ => Err(self.err(format!("expecting '{p}'"))),
        }
    }

    fn parse_program(&mut self) -> FrontResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        while self.peek().is_some() {
            stmts.push(self.parse_stmt()?);
        }
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> FrontResult<Stmt> {
        let line = self.line();
        let at = self.offset();
        let Some(Tok::Ident(first)) = self.peek().cloned() else {
            return Err(self.err("expecting a statement"));
        };
        if first == "return" {
            self.bump();
            let value = self.parse_expr()?;
            self.expect_punct(";")?;
            return Ok(Stmt::Return { value, at });
        }
        let volatile = first == "volatile";
        if volatile {
            self.bump();
        }
        let head = if volatile {
            match self.bump() {
                Some(Tok::Ident(t)) => t,
                _ => return Err(self.err("expecting a type after 'volatile'")),
            }
        } else {
            self.bump();
            first
        };
        if let Some(ty) = Type::parse(&head).filter(|_| is_type_name(&head)) {
            let name = match self.bump() {
                Some(Tok::Ident(n)) if !is_type_name(&n) => n,
                _ => return Err(self.err("expecting a variable name")),
            };
            let init = match self.peek() {
                Some(Tok::Punct("=")) => {
                    self.bump();
                    Some(self.parse_expr()?)
                }
                _ => None,
            };
            self.expect_punct(";")?;
            return Ok(Stmt::Decl {
                volatile,
                ty,
                name,
                init,
                line,
                at,
            });
        }
        if volatile {
            return Err(self.err("expecting a type after 'volatile'"));
        }
        // Assignment, compound assignment or ++/--.
        let name = head;
        match self.bump() {
            Some(Tok::Punct(op @ ("++" | "--"))) => {
                self.expect_punct(";")?;
                Ok(Stmt::IncDec { name, op, line, at })
            }
            Some(Tok::Punct(
                op @ ("=" | "+=" | "-=" | "*=" | "/=" | "%=" | "<<=" | ">>=" | "&=" | "|="
                | "^="),
            )) => {
                let value = self.parse_expr()?;
                self.expect_punct(";")?;
                Ok(Stmt::Assign {
                    name,
                    op,
                    value,
                    line,
                    at,
                })
            }
            _ => Err(self.err("expecting an assignment operator")),
        }
    }

    fn parse_expr(&mut self) -> FrontResult<Expr> {
        self.parse_binary(0)
    }

    // Precedence climbing over the binary operator tiers.
    fn parse_binary(&mut self, tier: usize) -> FrontResult<Expr> {
        const TIERS: &[&[&str]] = &[
            &["==", "!=", "<=", ">=", "<", ">"],
            &["&", "|", "^"],
            &["<<", ">>"],
            &["+", "-"],
            &["*", "/", "%"],
        ];
        if tier == TIERS.len() {
            return self.parse_unary();
        }
        let mut lhs = self.parse_binary(tier + 1)?;
        loop {
            let Some(Tok::Punct(p)) = self.peek() else {
                return Ok(lhs);
            };
            let Some(&op) = TIERS[tier].iter().find(|&&t| t == *p) else {
                return Ok(lhs);
            };
            self.bump();
            let rhs = self.parse_binary(tier + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_unary(&mut self) -> FrontResult<Expr> {
        if let Some(Tok::Punct(p @ ("-" | "~" | "!" | "?"))) = self.peek() {
            let op = *p;
            self.bump();
            let inner = self.parse_unary()?;
            return Ok(Expr::Unary(op, Box::new(inner)));
        }
        let line = self.line();
        match self.bump() {
            Some(Tok::Num(n)) => Ok(Expr::Num(n)),
            Some(Tok::Ident(name)) => Ok(Expr::Var(name, line)),
            Some(Tok::Punct("(")) => {
                let e = self.parse_expr()?;
                self.expect_punct(")")?;
                Ok(e)
            }
            _ => Err(self.err("expecting an expression")),
        }
    }
}

fn is_type_name(s: &str) -> bool {
    matches!(
        s,
        "u8" | "u16" | "u32" | "u64" | "s8" | "s16" | "s32" | "s64"
    )
}

// ---- emission ------------------------------------------------------------

/// Compile preprocessed source text into a program rooted at the entry
/// function.
pub fn compile(source: &str, cfg: &EmitConfig) -> Result<Program, FrontendError> {
    compile_with_provenance(source, cfg, &|_| DebugInfo::default())
}

/// Compile with a provenance lookup, typically backed by the chunk
/// metadata the preprocessor preserves per output offset.
pub fn compile_with_provenance(
    source: &str,
    cfg: &EmitConfig,
    lookup: SrcLookup<'_>,
) -> Result<Program, FrontendError> {
    let mut lexer = Lexer::new(source);
    let mut toks = Vec::new();
    while let Some(t) = lexer.next()? {
        toks.push(t);
    }
    let mut parser = Parser { toks, pos: 0 };
    let stmts = parser.parse_program()?;

    // Two passes; only the second one's program carries instructions.
    {
        let mut scratch = Program::new();
        emit_program(&mut scratch, cfg, &stmts, Pass::First, lookup)?;
    }
    let mut prog = Program::new();
    emit_program(&mut prog, cfg, &stmts, Pass::Second, lookup)?;
    Ok(prog)
}

/// Convenience wrapper producing the full compile-result shape.
pub fn compile_to_result(
    source: &str,
    cfg: &EmitConfig,
    src_file_paths: Vec<std::path::PathBuf>,
    lookup: SrcLookup<'_>,
) -> Result<CompileResult, FrontendError> {
    let program = compile_with_provenance(source, cfg, lookup)?;
    Ok(CompileResult {
        program,
        string_region: Vec::new(),
        global_region_size: 0,
        src_file_paths,
    })
}

fn emit_program(
    prog: &mut Program,
    cfg: &EmitConfig,
    stmts: &[Stmt],
    pass: Pass,
    lookup: SrcLookup<'_>,
) -> FrontResult<()> {
    let root = prog.root();
    let mut cx = Cx::new(cfg, prog, root, pass);
    let mut env: HashMap<String, Var> = HashMap::new();

    // The stackframe is carved below the initial stack pointer; the
    // prologue and epilogue adjustments are patched once the frame size
    // is known. Instructions exist only in the second pass.
    let prologue = (pass == Pass::Second).then(|| cx.addi(Reg::SP, Reg::SP, 0));

    for stmt in stmts {
        cx.srcloc = lookup(stmt.at());
        match stmt {
            Stmt::Decl {
                volatile,
                ty,
                name,
                init,
                line,
                ..
            } => {
                if env.contains_key(name) {
                    return Err(FrontendError::DuplicateVariable {
                        line: *line,
                        name: name.clone(),
                    });
                }
                let v = cx.vars.declare(name, ty.clone(), cx.cfg.sizeof_gpr);
                cx.vars.get_mut(v).volatile = *volatile;
                env.insert(name.clone(), v);
                if let Some(e) = init {
                    let rhs = emit_expr(&mut cx, &env, e)?;
                    apply_operator(&mut cx, "=", v, Some(rhs))?;
                }
            }
            Stmt::Assign {
                name,
                op,
                value,
                line,
                ..
            } => {
                let v = lookup_var(&env, name, *line)?;
                let rhs = emit_expr(&mut cx, &env, value)?;
                apply_operator(&mut cx, op, v, Some(rhs))?;
            }
            Stmt::IncDec { name, op, line, .. } => {
                let v = lookup_var(&env, name, *line)?;
                apply_operator(&mut cx, op, v, None)?;
            }
            Stmt::Return { value, .. } => {
                let v = emit_expr(&mut cx, &env, value)?;
                if cx.pass == Pass::Second {
                    // The program's result is architectural register 1 at
                    // the final jpop.
                    let number = cx.vars.get(v).number;
                    match number {
                        Some(n) => {
                            cx.li(Reg::new(1), n);
                        }
                        None => {
                            let arg = oparg(&cx, v);
                            let r = cx.input_reg(&arg);
                            cx.op2(Opcode::Cpy, Reg::new(1), r);
                            cx.unlock(r);
                        }
                    }
                }
                break;
            }
        }
    }

    if let Some(prologue) = prologue {
        let frame = i64::from(cx.vars.frame_size());
        cx.addi(Reg::SP, Reg::SP, frame);
        let f = cx.func_mut();
        f.inst_mut(prologue).imm = Some(lyrical_codegen::Imm::value(-frame));
        f.append(lyrical_codegen::InstructionData::new(Opcode::Jpop));
    }
    Ok(())
}

fn lookup_var(env: &HashMap<String, Var>, name: &str, line: u32) -> FrontResult<Var> {
    env.get(name).copied().ok_or_else(|| {
        FrontendError::UnknownVariable {
            line,
            name: name.to_owned(),
        }
    })
}

fn oparg(cx: &Cx, v: Var) -> OpArg {
    OpArg {
        var: v,
        varpushed: v,
        pushed_ty: cx.vars.get(v).ty.clone(),
        bitselect: 0,
        byref: false,
        to_output: false,
    }
}

fn apply_operator(cx: &mut Cx, op: &str, first: Var, second: Option<Var>) -> FrontResult<Var> {
    let mut args = CallArgs {
        args: match second {
            Some(s) => vec![oparg(cx, first), oparg(cx, s)],
            None => vec![oparg(cx, first)],
        },
        registered: Vec::new(),
    };
    Ok(native_operator(cx, op, &mut args)?)
}

fn emit_expr(cx: &mut Cx, env: &HashMap<String, Var>, e: &Expr) -> FrontResult<Var> {
    match e {
        Expr::Num(n) => {
            let word = Type::word(cx.cfg.sizeof_gpr);
            Ok(cx.number_result(*n, &word))
        }
        Expr::Var(name, line) => lookup_var(env, name, *line),
        Expr::Unary(op, inner) => {
            let v = emit_expr(cx, env, inner)?;
            apply_operator(cx, op, v, None)
        }
        Expr::Binary(op, l, r) => {
            let lv = emit_expr(cx, env, l)?;
            let rv = emit_expr(cx, env, r)?;
            apply_operator(cx, op, lv, Some(rv))
        }
    }
}
