//! Assembly language parser.
//!
//! Converts human-readable assembly source into a validated [`Program`].
//!
//! # Syntax
//!
//! ```text
//! .globals 8                    # directive
//! .const long 1000              # constant copied into global 0 at load
//! start:                        # label, resolves to the next instruction
//!     SET_L 0, 42, 0            # specialized mnemonic, then operands
//!     LONG_ADD_GLL 0, 0, 1
//!     JUMP_CHECK_L 1, start
//! ```
//!
//! - Mnemonics carry one `L`/`G` letter per register operand
//! - Register operands are indices, optionally prefixed with `r`
//! - Immediates are decimal (`-1` is stored as its 16-bit two's complement),
//!   label names, `true`/`false`, trace modes `none`/`all`/`some`, or char
//!   literals like `'a'`
//! - Comments start with `#`, commas between operands are optional
//! - `ABORT 0` is appended when the source does not end with it
//!
//! Directives: `.stack N`, `.frames N`, `.globals N` size the machine;
//! `.const long|float|char|bool VALUE` appends to the constant pool.

use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::{Instruction, Opcode};
use crate::virtual_machine::operand::OperandKind;
use crate::virtual_machine::program::{Constant, Program, ProgramHeader};
use std::collections::HashMap;
use std::fmt::Write;
use std::fs;
use std::path::Path;

const COMMENT_CHAR: char = '#';
const LABEL_SUFFIX: char = ':';
const DIRECTIVE_PREFIX: char = '.';
const REGISTER_PREFIX: char = 'r';

/// Formats a compiler-style diagnostic for an assembly failure.
///
/// Errors without a source location render as a single line.
pub fn render_diagnostic(file: &str, source: &str, err: &VMError) -> String {
    let VMError::AssemblyError {
        line,
        offset,
        source: message,
    } = err
    else {
        return format!("error: {err}");
    };

    let mut diag = String::new();
    let _ = writeln!(diag, "error: {message}");
    let _ = writeln!(diag, " --> {file}:{line}:{offset}");

    if let Some(raw_line) = source.lines().nth(line.saturating_sub(1)) {
        let line_text = raw_line.trim_end_matches('\r');
        let underline = " ".repeat(offset.saturating_sub(1));
        let _ = writeln!(diag, "  |");
        let _ = writeln!(diag, "{:>4} | {}", line, line_text);
        let _ = writeln!(diag, "  | {}^", underline);
    }

    diag
}

fn located(line: usize, offset: usize, err: VMError) -> VMError {
    match err {
        located @ VMError::AssemblyError { .. } => located,
        other => VMError::AssemblyError {
            line,
            offset,
            source: other.to_string(),
        },
    }
}

/// Labels, header and constant pool collected while assembling.
#[derive(Default)]
struct AsmContext {
    labels: HashMap<String, u16>,
    header: ProgramHeader,
    constants: Vec<Constant>,
}

impl AsmContext {
    fn define_label(&mut self, name: &str, index: u16) -> Result<(), VMError> {
        if self.labels.insert(name.to_string(), index).is_some() {
            return Err(VMError::DuplicateLabel(name.to_string()));
        }
        Ok(())
    }

    fn resolve_label(&self, name: &str) -> Result<u16, VMError> {
        self.labels
            .get(name)
            .copied()
            .ok_or_else(|| VMError::UndefinedLabel(name.to_string()))
    }
}

#[derive(Debug, Clone, Copy)]
struct Token<'a> {
    text: &'a str,
    /// 1-based column offset in the line.
    offset: usize,
}

/// Tokenize a single line of assembly.
///
/// Rules:
/// - `#` starts a comment
/// - commas are ignored
/// - whitespace-separated tokens
/// - `'...'` is kept as one token
fn tokenize(line_no: usize, line: &str) -> Result<Vec<Token<'_>>, VMError> {
    let mut out = Vec::with_capacity(4);

    let mut start: Option<usize> = None;
    let mut start_col: usize = 0;
    let mut in_quote = false;

    for (i, ch) in line.char_indices() {
        if ch == COMMENT_CHAR && !in_quote {
            if let Some(s) = start.take() {
                out.push(Token {
                    text: &line[s..i],
                    offset: start_col,
                });
            }
            return Ok(out);
        }

        match ch {
            '\'' => {
                if start.is_none() {
                    start = Some(i);
                    start_col = i + 1;
                }
                in_quote = !in_quote;
            }
            ',' | ' ' | '\t' | '\r' if !in_quote => {
                if let Some(s) = start.take() {
                    out.push(Token {
                        text: &line[s..i],
                        offset: start_col,
                    });
                }
            }
            _ => {
                if start.is_none() {
                    start = Some(i);
                    start_col = i + 1;
                }
            }
        }
    }

    if in_quote {
        return Err(VMError::AssemblyError {
            line: line_no,
            offset: start_col,
            source: "unterminated char literal (missing closing quote)".to_string(),
        });
    }

    if let Some(s) = start {
        out.push(Token {
            text: &line[s..],
            offset: start_col,
        });
    }

    Ok(out)
}

fn invalid(tok: &str) -> VMError {
    VMError::InvalidOperand {
        token: tok.to_string(),
    }
}

/// Parse a register index like `3` or `r3`.
fn parse_register(tok: &str) -> Result<u16, VMError> {
    tok.strip_prefix(REGISTER_PREFIX)
        .unwrap_or(tok)
        .parse::<u16>()
        .map_err(|_| invalid(tok))
}

/// Parse a char literal like `'a'`.
fn parse_char(tok: &str) -> Option<char> {
    let inner = tok.strip_prefix('\'')?.strip_suffix('\'')?;
    let mut chars = inner.chars();
    let ch = chars.next()?;
    chars.next().is_none().then_some(ch)
}

fn looks_numeric(tok: &str) -> bool {
    tok.starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '+')
}

/// Parse a 16-bit immediate: number, keyword, char literal or label.
fn parse_immediate(ctx: &AsmContext, tok: &str) -> Result<u16, VMError> {
    if looks_numeric(tok) {
        return match tok.parse::<u16>() {
            Ok(v) => Ok(v),
            Err(_) => tok.parse::<i16>().map(|v| v as u16).map_err(|_| invalid(tok)),
        };
    }
    match tok {
        "false" | "none" => return Ok(0),
        "true" | "all" => return Ok(1),
        "some" => return Ok(2),
        _ => {}
    }
    if tok.starts_with('\'') {
        let ch = parse_char(tok).ok_or_else(|| invalid(tok))?;
        return u16::try_from(ch as u32).map_err(|_| invalid(tok));
    }
    ctx.resolve_label(tok)
}

fn parse_bool(tok: &str) -> Result<bool, VMError> {
    match tok {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid(tok)),
    }
}

/// Applies a `.directive` line to the context.
fn parse_directive(ctx: &mut AsmContext, tokens: &[Token]) -> Result<(), VMError> {
    let name = tokens[0].text;
    let args: Vec<&str> = tokens[1..].iter().map(|t| t.text).collect();
    let size = |tok: &str| tok.parse::<u32>().map_err(|_| invalid(tok));

    match (name, args.as_slice()) {
        (".stack", &[n]) => ctx.header.stack_size = size(n)?,
        (".frames", &[n]) => ctx.header.frame_limit = size(n)?,
        (".globals", &[n]) => ctx.header.global_count = size(n)?,
        (".const", &[kind, value]) => {
            let constant = match kind {
                "long" => Constant::Long(value.parse().map_err(|_| invalid(value))?),
                "float" => Constant::Float(value.parse().map_err(|_| invalid(value))?),
                "char" => Constant::Char(
                    parse_char(value)
                        .or_else(|| value.parse::<u32>().ok().and_then(char::from_u32))
                        .ok_or_else(|| invalid(value))?,
                ),
                "bool" => Constant::Bool(parse_bool(value)?),
                _ => return Err(VMError::InvalidDirective(format!(".const {kind}"))),
            };
            ctx.constants.push(constant);
        }
        _ => return Err(VMError::InvalidDirective(name.to_string())),
    }
    Ok(())
}

/// Parse one instruction from tokens, reporting errors at the offending token.
fn parse_instruction(ctx: &AsmContext, line_no: usize, tokens: &[Token]) -> Result<Instruction, VMError> {
    let head = tokens[0];
    let at = |tok: Token, err| located(line_no, tok.offset, err);

    let opcode = Opcode::from_mnemonic(head.text)
        .ok_or_else(|| at(head, VMError::UnknownMnemonic(head.text.to_string())))?;
    let kinds = opcode.decode().map_err(|_| at(head, invalid(head.text)))?.operands();

    let args = &tokens[1..];
    if args.len() != kinds.len() {
        return Err(at(
            head,
            VMError::ArityMismatch {
                mnemonic: head.text.to_string(),
                expected: kinds.len(),
                actual: args.len(),
            },
        ));
    }

    let mut slots = [0u16; 3];
    for (slot, (kind, &tok)) in kinds.iter().zip(args).enumerate() {
        let value = match kind {
            OperandKind::Reg | OperandKind::Loc => parse_register(tok.text),
            OperandKind::Imm => parse_immediate(ctx, tok.text),
        };
        slots[slot] = value.map_err(|e| at(tok, e))?;
    }

    Ok(Instruction::new(opcode, slots[0], slots[1], slots[2]))
}

/// Checks if a token is a label definition (ends with `:`)
fn is_label_def(tok: &str) -> bool {
    tok.ends_with(LABEL_SUFFIX) && tok.len() > 1
}

/// Extracts the label name from a label definition token.
fn label_name(tok: &str) -> &str {
    &tok[..tok.len() - 1]
}

/// Assemble a full source string into a program.
///
/// Uses two-pass assembly:
/// 1. First pass: tokenize lines, apply directives, record label positions
/// 2. Second pass: parse instructions with label resolution
pub fn assemble_source(source: &str) -> Result<Program, VMError> {
    let mut ctx = AsmContext::default();
    let mut pending: Vec<(usize, Vec<Token>)> = Vec::new();

    for (line_no, line) in source.lines().enumerate() {
        let line_no = line_no + 1;
        let mut tokens = tokenize(line_no, line)?;
        if tokens.is_empty() {
            continue;
        }

        if tokens[0].text.starts_with(DIRECTIVE_PREFIX) {
            parse_directive(&mut ctx, &tokens).map_err(|e| located(line_no, tokens[0].offset, e))?;
            continue;
        }

        if is_label_def(tokens[0].text) {
            let index = u16::try_from(pending.len()).map_err(|_| VMError::AssemblyError {
                line: line_no,
                offset: tokens[0].offset,
                source: "program exceeds the addressable instruction range".to_string(),
            })?;
            ctx.define_label(label_name(tokens[0].text), index)
                .map_err(|e| located(line_no, tokens[0].offset, e))?;
            tokens.remove(0);
            if tokens.is_empty() {
                continue;
            }
        }

        pending.push((line_no, tokens));
    }

    let mut instructions = Vec::with_capacity(pending.len() + 1);
    for (line_no, tokens) in &pending {
        instructions.push(parse_instruction(&ctx, *line_no, tokens)?);
    }
    if !instructions.last().is_some_and(Instruction::is_sentinel) {
        instructions.push(Instruction::SENTINEL);
    }

    Program::new(ctx.header, ctx.constants, instructions)
}

/// Convenience: assemble directly from file path
pub fn assemble_file<P: AsRef<Path>>(path: P) -> Result<Program, VMError> {
    let path_ref = path.as_ref();
    let source = fs::read_to_string(path_ref).map_err(|e| VMError::IoError {
        path: path_ref.display().to_string(),
        source: e.to_string(),
    })?;
    assemble_source(&source)
}
