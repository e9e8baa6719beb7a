//! Crate-wide error hierarchy.
//!
//! One `thiserror` enum per pipeline layer, composed into a single [`Error`] so the
//! CLI driver can match once and pick the exit code from SPEC_FULL.md §7 without
//! threading layer-specific types through `main.rs`.

use thiserror::Error;

/// Failures while turning source bytes into a token stream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LexError {
    #[error("line {line}: unterminated string literal")]
    UnterminatedString { line: u32 },
    #[error("line {line}: unrecognized character {ch:?}")]
    UnrecognizedChar { ch: char, line: u32 },
}

/// Failures while turning tokens into an AST.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("line {line}: expected {expected}, found {found:?}")]
    UnexpectedToken {
        expected: String,
        found: String,
        line: u32,
    },
    #[error("line {line}: unexpected end of input, expected {expected}")]
    UnexpectedEof { expected: String, line: u32 },
    #[error("line {line}: duplicate local `{name}` in the same method body")]
    DuplicateLocal { name: String, line: u32 },
}

/// Failures during type checking.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("line {line}: undefined identifier `{name}`")]
    Undefined { name: String, line: u32 },
    #[error("line {line}: class `{name}` is already defined")]
    DuplicateClass { name: String, line: u32 },
    #[error("line {line}: unknown class `{name}`")]
    UnknownClass { name: String, line: u32 },
    #[error("line {line}: class `{class}` has no field or method `{member}`")]
    UnknownMember {
        class: String,
        member: String,
        line: u32,
    },
    #[error("line {line}: field `{field}` of `{class}` is not accessible outside its declaring class")]
    FieldNotAccessible {
        class: String,
        field: String,
        line: u32,
    },
    #[error("line {line}: expected {expected}, got {got}")]
    Mismatch {
        expected: String,
        got: String,
        line: u32,
    },
    #[error("line {line}: call to `{method}` expects {expected} argument(s), got {got}")]
    Arity {
        method: String,
        expected: usize,
        got: usize,
        line: u32,
    },
}

/// Failures while emitting bytecode from a checked AST.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodegenError {
    #[error("name `{name}` is {len} bytes long, exceeding the {max}-byte manifest limit")]
    NameTooLong { name: String, len: usize, max: usize },
    #[error("method `{name}` has a branch or loop whose label was never resolved")]
    UnresolvedLabel { name: String },
    #[error("method `{name}` has more than 8 parameters, exceeding the manifest limit")]
    TooManyParams { name: String },
}

/// Failures while resolving symbolic references and finalising manifests.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("call to undefined method `{name}`")]
    UnresolvedMethod { name: String },
    #[error("call to `{name}` is ambiguous: defined on {count} classes with no statically resolved receiver")]
    AmbiguousMethod { name: String, count: usize },
    #[error("method `{name}` offset {offset} lies outside the CODE section (len {code_len})")]
    OffsetOutOfRange {
        name: String,
        offset: u64,
        code_len: usize,
    },
    #[error("no zero-argument procedure named `main` found on any class")]
    NoEntryPoint,
    #[error("class `{class}` inherits from itself through `extends`")]
    InheritanceCycle { class: String },
}

/// Failures reading or validating a `.mod` file. Refusal here is total: the reader
/// never produces partial derived state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModuleError {
    #[error("bad magic number")]
    BadMagic,
    #[error("file is truncated: expected at least {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("unsupported module version {found}, expected {expected}")]
    UnknownVersion { found: u32, expected: u32 },
    #[error("TOC entry `{name}` offset {offset} + size {size} exceeds data region of {data_size} bytes")]
    TocOutOfRange {
        name: String,
        offset: u64,
        size: u64,
        data_size: u64,
    },
    #[error("section `{name}` overflows the declared data_size")]
    SectionOverflow { name: String },
    #[error("duplicate TOC section name `{name}`")]
    DuplicateSection { name: String },
    #[error("required section `{name}` is missing from the module")]
    MissingSection { name: String },
    #[error("section `{name}` size is not a multiple of its record size")]
    MisalignedSection { name: String },
}

/// A runtime-detected precondition violation that halts the VM.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrapKind {
    #[error("division by zero")]
    DivideByZero,
    #[error("modulo by zero")]
    ModuloByZero,
    #[error("operand stack underflow")]
    StackUnderflow,
    #[error("operand stack overflow")]
    StackOverflow,
    #[error("call stack overflow")]
    CallStackOverflow,
    #[error("null receiver")]
    NullReceiver,
    #[error("invalid object handle {0}")]
    BadHandle(u32),
    #[error("invalid method offset {0}")]
    BadMethodOffset(u64),
    #[error("method at offset {offset} is not defined on class {class_id} or any ancestor")]
    MethodNotOnClass { offset: u64, class_id: u64 },
    #[error("local slot {slot} out of range (frame has {len})")]
    BadSlot { slot: u64, len: usize },
    #[error("invalid string id {0}")]
    BadStringId(u32),
    #[error("invalid field offset {offset} on instance of size {size}")]
    BadFieldOffset { offset: u64, size: u64 },
    #[error("instruction pointer {0} out of range")]
    BadProgramCounter(u64),
    #[error("reserved opcode high nibble was non-zero at instruction {0}")]
    MalformedOpcode(u64),
}

/// A trap, with the diagnostic context SPEC_FULL.md §7 requires: the offending `pc`,
/// the enclosing method name if the manifest could resolve one, and the source line
/// if a DEBUG section was present.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("trap at pc={pc}{}{}: {kind}",
    .method.as_ref().map(|m| format!(" in `{m}`")).unwrap_or_default(),
    .line.map(|l| format!(" (line {l})")).unwrap_or_default())]
pub struct Trap {
    pub pc: u64,
    pub method: Option<String>,
    pub line: Option<u32>,
    pub kind: TrapKind,
}

impl Trap {
    pub fn new(pc: u64, kind: TrapKind) -> Trap {
        Trap {
            pc,
            method: None,
            line: None,
            kind,
        }
    }

    pub fn with_context(mut self, method: Option<String>, line: Option<u32>) -> Trap {
        self.method = method;
        self.line = line;
        self
    }
}

/// The top-level crate error. The CLI driver matches on this once to select an exit
/// code (SPEC_FULL.md §7); library callers are free to match on the specific variant.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error(transparent)]
    Codegen(#[from] CodegenError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Module(#[from] ModuleError),
    #[error(transparent)]
    Trap(#[from] Trap),
    #[error("{0}")]
    Io(String),
}

pub type Result<T> = core::result::Result<T, Error>;
