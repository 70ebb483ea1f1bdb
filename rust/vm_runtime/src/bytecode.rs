//! Bytecode image model for the Weft virtual machine.
//!
//! A compiled template is a single byte buffer: an 8-byte header, a code
//! section of opcode bytes with inline little-endian operands, and a data
//! section holding length-prefixed string literals and function descriptors.
//! The types below describe the image format and provide the builder the
//! compile pipeline (and the test suite) uses to assemble images.  They
//! intentionally mirror what the interpreter decodes so assembly remains
//! largely mechanical.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of the image header: `u32 code_section_end` + `u32 entry_offset`.
pub const HEADER_BYTES: usize = 8;

/// Debug payload detail level selected at compile time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebugMode {
    #[default]
    None,
    Minimal,
    Full,
}

/// Compile-time constants shared by the assembler and the interpreter.
///
/// `max_locals` selects the width of local-slot operands; builder and VM must
/// be handed the same `Config` value or the encoding disagrees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub max_locals: u32,
    pub max_call_frames: usize,
    pub initial_code_size: usize,
    pub initial_data_size: usize,
    pub deduplicate_string_literals: bool,
    pub escape_by_default: bool,
    pub debug: DebugMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_locals: 256,
            max_call_frames: 255,
            initial_code_size: 512,
            initial_data_size: 512,
            deduplicate_string_literals: true,
            escape_by_default: false,
            debug: DebugMode::None,
        }
    }
}

impl Config {
    /// Byte width of local-slot indices in the instruction stream.
    pub fn local_width(&self) -> usize {
        if self.max_locals <= 256 {
            1
        } else {
            2
        }
    }
}

/// Enumeration of all opcodes recognised by the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    /// Pop and discard the top of the stack.
    Pop = 0,
    /// Push an inline `i64`.
    ConstantI64 = 1,
    /// Push an inline `f64`.
    ConstantF64 = 2,
    /// Push a bool (`u8` operand, zero is false).
    ConstantBool = 3,
    /// Push a string borrowing the literal at a `u32` data-section offset.
    ConstantString = 4,
    /// Push null.
    ConstantNull = 5,
    /// Push a copy of a local slot.
    GetLocal = 6,
    /// Write the top of the stack into a local slot; the stack is unchanged.
    SetLocal = 7,
    /// Add an inline delta to an integer slot and push the new value.
    /// A delta byte of zero is the sentinel for `-1`.
    Incr = 8,
    Add = 9,
    Subtract = 10,
    Multiply = 11,
    Divide = 12,
    Modulus = 13,
    /// Unary minus on the top of the stack.
    Negate = 14,
    /// Logical not on the top of the stack (bool only).
    Not = 15,
    Equal = 16,
    Greater = 17,
    Lesser = 18,
    /// Unconditional relative branch (`i16`, measured from instruction end).
    Jump = 19,
    /// Relative branch unless the top of the stack is `true`; does not pop.
    JumpIfFalse = 20,
    /// Pop `u32` values into a new list, preserving order, and push it.
    InitializeArray = 21,
    /// Pop index, pop target, push `target[index]`.
    IndexGet = 22,
    /// Call the function described at a `u32` data-section offset.
    Call = 23,
    /// Dispatch to a registered host function (`u32` id, `u8` arg count).
    CallHost = 24,
    /// Pop the return value and unwind one frame (or finish the run).
    Return = 25,
    /// Pop and format to the run's sink.
    Print = 26,
    /// Skip an inline debug record (`u16` length, prefix included).
    Debug = 27,
}

impl Opcode {
    /// Decode an opcode byte; `None` for bytes outside the instruction set.
    pub fn decode(byte: u8) -> Option<Opcode> {
        Some(match byte {
            0 => Opcode::Pop,
            1 => Opcode::ConstantI64,
            2 => Opcode::ConstantF64,
            3 => Opcode::ConstantBool,
            4 => Opcode::ConstantString,
            5 => Opcode::ConstantNull,
            6 => Opcode::GetLocal,
            7 => Opcode::SetLocal,
            8 => Opcode::Incr,
            9 => Opcode::Add,
            10 => Opcode::Subtract,
            11 => Opcode::Multiply,
            12 => Opcode::Divide,
            13 => Opcode::Modulus,
            14 => Opcode::Negate,
            15 => Opcode::Not,
            16 => Opcode::Equal,
            17 => Opcode::Greater,
            18 => Opcode::Lesser,
            19 => Opcode::Jump,
            20 => Opcode::JumpIfFalse,
            21 => Opcode::InitializeArray,
            22 => Opcode::IndexGet,
            23 => Opcode::Call,
            24 => Opcode::CallHost,
            25 => Opcode::Return,
            26 => Opcode::Print,
            27 => Opcode::Debug,
            _ => return None,
        })
    }
}

/// Image-level validation errors raised when attaching to a byte buffer.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image of {0} bytes is shorter than the 8-byte header")]
    TooShort(usize),
    #[error("code section end {end} outside image of {len} bytes")]
    CodeSection { end: usize, len: usize },
    #[error("entry offset {entry} outside code section of {len} bytes")]
    Entry { entry: usize, len: usize },
}

/// A compiled template: immutable after assembly, shareable across threads,
/// rendered many times by short-lived VMs.
#[derive(Debug, Clone)]
pub struct Image {
    bytes: Vec<u8>,
    code_end: usize,
    entry: usize,
}

impl Image {
    /// Attach to a byte buffer, validating the header.
    pub fn new(bytes: Vec<u8>) -> Result<Image, ImageError> {
        if bytes.len() < HEADER_BYTES {
            return Err(ImageError::TooShort(bytes.len()));
        }
        let code_end = read_u32(&bytes, 0) as usize;
        if code_end < HEADER_BYTES || code_end > bytes.len() {
            return Err(ImageError::CodeSection {
                end: code_end,
                len: bytes.len(),
            });
        }
        let entry = read_u32(&bytes, 4) as usize;
        let code_len = code_end - HEADER_BYTES;
        if entry >= code_len.max(1) {
            return Err(ImageError::Entry {
                entry,
                len: code_len,
            });
        }
        Ok(Image {
            bytes,
            code_end,
            entry,
        })
    }

    /// The code section; branch and entry offsets are relative to its start.
    pub fn code(&self) -> &[u8] {
        &self.bytes[HEADER_BYTES..self.code_end]
    }

    /// The data section: string literals and function descriptors.
    pub fn data(&self) -> &[u8] {
        &self.bytes[self.code_end..]
    }

    /// Entry offset of the main script, relative to the code section.
    pub fn entry_offset(&self) -> usize {
        self.entry
    }

    /// The raw image, header included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Resolve a string literal at `offset` in the data section.
///
/// Layout is a `u32` end offset (absolute within the data section, pointing
/// past the final byte) followed by the raw bytes.  Returns `(start, len)`
/// of the payload, or `None` when the record is truncated.
pub fn read_string(data: &[u8], offset: usize) -> Option<(usize, usize)> {
    let end = read_u32_checked(data, offset)? as usize;
    let start = offset.checked_add(4)?;
    if end < start || end > data.len() {
        return None;
    }
    Some((start, end - start))
}

/// A function's calling convention: `u8` arity + `u32` code offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionDescriptor {
    pub arity: u8,
    pub code_offset: usize,
}

/// Resolve a function descriptor at `offset` in the data section.
pub fn read_function(data: &[u8], offset: usize) -> Option<FunctionDescriptor> {
    let arity = *data.get(offset)?;
    let code_offset = read_u32_checked(data, offset.checked_add(1)?)? as usize;
    Some(FunctionDescriptor { arity, code_offset })
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_u32_checked(bytes: &[u8], at: usize) -> Option<u32> {
    let end = at.checked_add(4)?;
    let slice = bytes.get(at..end)?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(slice);
    Some(u32::from_le_bytes(raw))
}

/// Programmatic assembler for bytecode images.
///
/// The builder owns the growing code and data sections, interns string
/// literals (deduplicated when the configuration asks for it), and provides
/// the emit/patch helpers the code generator needs for branches.
pub struct ImageBuilder {
    config: Config,
    code: Vec<u8>,
    data: Vec<u8>,
    strings: HashMap<Vec<u8>, u32>,
}

impl ImageBuilder {
    pub fn new(config: Config) -> Self {
        let code = Vec::with_capacity(config.initial_code_size);
        let data = Vec::with_capacity(config.initial_data_size);
        Self {
            config,
            code,
            data,
            strings: HashMap::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current code offset; the target of a function about to be emitted or
    /// of a backward branch.
    pub fn here(&self) -> usize {
        self.code.len()
    }

    pub fn op(&mut self, op: Opcode) {
        self.code.push(op as u8);
    }

    pub fn emit_u8(&mut self, value: u8) {
        self.code.push(value);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_i64(&mut self, value: i64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_f64(&mut self, value: f64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a local-slot index at the configured width.
    pub fn emit_local(&mut self, slot: u32) {
        if self.config.local_width() == 1 {
            self.code.push(slot as u8);
        } else {
            self.code.extend_from_slice(&(slot as u16).to_le_bytes());
        }
    }

    /// Intern a string literal in the data section, returning its offset.
    pub fn add_string(&mut self, bytes: &[u8]) -> u32 {
        if self.config.deduplicate_string_literals {
            if let Some(&offset) = self.strings.get(bytes) {
                return offset;
            }
        }
        let offset = self.data.len() as u32;
        let end = (self.data.len() + 4 + bytes.len()) as u32;
        self.data.extend_from_slice(&end.to_le_bytes());
        self.data.extend_from_slice(bytes);
        if self.config.deduplicate_string_literals {
            self.strings.insert(bytes.to_vec(), offset);
        }
        offset
    }

    /// Register a function descriptor, returning its data-section offset for
    /// use as a `Call` operand.
    pub fn add_function(&mut self, arity: u8, code_offset: u32) -> u32 {
        let offset = self.data.len() as u32;
        self.data.push(arity);
        self.data.extend_from_slice(&code_offset.to_le_bytes());
        offset
    }

    /// Emit `ConstantString` for a literal, interning it on the way.
    pub fn const_str(&mut self, bytes: &[u8]) -> u32 {
        let offset = self.add_string(bytes);
        self.op(Opcode::ConstantString);
        self.emit_u32(offset);
        offset
    }

    /// Emit a forward branch with a placeholder offset; returns the patch
    /// position for [`Self::patch_jump`].
    pub fn jump(&mut self, op: Opcode) -> usize {
        self.op(op);
        let at = self.code.len();
        self.emit_u16(0);
        at
    }

    /// Point the branch emitted at `at` to the current code offset.
    /// Offsets are measured from the byte after the 16-bit operand.
    pub fn patch_jump(&mut self, at: usize) {
        let offset = (self.code.len() as i64 - (at as i64 + 2)) as i16;
        let raw = offset.to_le_bytes();
        self.code[at] = raw[0];
        self.code[at + 1] = raw[1];
    }

    /// Emit a backward branch to an already-emitted code offset.
    pub fn jump_to(&mut self, op: Opcode, target: usize) {
        self.op(op);
        let offset = (target as i64 - (self.code.len() as i64 + 2)) as i16;
        self.emit_u16(offset as u16);
    }

    /// Emit a `Debug` sidecar record the interpreter will skip.  The stored
    /// length covers the two prefix bytes.  A no-op unless the configuration
    /// asks for full debug payloads.
    pub fn debug_record(&mut self, payload: &[u8]) {
        if self.config.debug != DebugMode::Full {
            return;
        }
        self.op(Opcode::Debug);
        self.emit_u16((payload.len() + 2) as u16);
        self.code.extend_from_slice(payload);
    }

    /// Seal the image with the main script's entry offset.
    pub fn finish(self, entry_offset: u32) -> Result<Image, ImageError> {
        let code_end = (HEADER_BYTES + self.code.len()) as u32;
        let mut bytes = Vec::with_capacity(HEADER_BYTES + self.code.len() + self.data.len());
        bytes.extend_from_slice(&code_end.to_le_bytes());
        bytes.extend_from_slice(&entry_offset.to_le_bytes());
        bytes.extend_from_slice(&self.code);
        bytes.extend_from_slice(&self.data);
        Image::new(bytes)
    }
}
