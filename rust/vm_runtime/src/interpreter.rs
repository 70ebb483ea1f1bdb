//! Bytecode interpreter for the Weft virtual machine.
//!
//! The interpreter executes a compiled image from its entry offset: an
//! instruction pointer scans the code section, operands decode inline, and
//! locals live on the value stack addressed relative to the current frame
//! pointer.  It is intentionally conservative: every allocation goes through
//! the per-run arena, the sandbox meters ticks and stack growth, and any
//! typed failure terminates the run with the error record left on the VM for
//! the caller to inspect.

use std::cmp::Ordering;
use std::io::{self, Write};

use thiserror::Error;

use crate::bytecode::{read_function, Config, Image, Opcode};
use crate::host::{HostError, HostFunctions};
use crate::memory::{HeapObject, HeapRef, KeyRef, Memory, MemoryError, MemoryMetrics};
use crate::render::{describe, write_value};
use crate::sandbox::{Sandbox, SandboxError, SandboxLimits, SandboxMetrics};
use crate::value::{equal, order, Incompatible, Value};

/// Errors surfaced by the interpreter.  Each carries a human description
/// formatted during the failing run.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("type error: {0}")]
    Type(String),
    #[error("index out of range: {0}")]
    OutOfRange(String),
    #[error("stack overflow: {0}")]
    StackOverflow(String),
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("malformed bytecode: {0}")]
    Malformed(String),
    #[error("execution budget exhausted: {0}")]
    Budget(String),
    #[error("output failed: {0}")]
    Output(String),
}

impl RuntimeError {
    /// Stable kind name for reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeError::Type(_) => "type",
            RuntimeError::OutOfRange(_) => "out of range",
            RuntimeError::StackOverflow(_) => "stack overflow",
            RuntimeError::OutOfMemory(_) => "out of memory",
            RuntimeError::Malformed(_) => "malformed",
            RuntimeError::Budget(_) => "budget",
            RuntimeError::Output(_) => "output",
        }
    }
}

impl From<MemoryError> for RuntimeError {
    fn from(error: MemoryError) -> Self {
        match error {
            MemoryError::BudgetExceeded { .. } => RuntimeError::OutOfMemory(error.to_string()),
            MemoryError::StaleHandle | MemoryError::InvalidHandle => {
                RuntimeError::Malformed(error.to_string())
            }
        }
    }
}

impl From<SandboxError> for RuntimeError {
    fn from(error: SandboxError) -> Self {
        match error {
            SandboxError::TickLimit { .. } => RuntimeError::Budget(error.to_string()),
            SandboxError::StackLimit { .. } => RuntimeError::StackOverflow(error.to_string()),
        }
    }
}

impl From<HostError> for RuntimeError {
    fn from(error: HostError) -> Self {
        match error {
            HostError::Memory(inner) => inner.into(),
            other => RuntimeError::Type(other.to_string()),
        }
    }
}

/// Saved caller state; the live frame's fields sit directly on the VM.
#[derive(Debug, Clone, Copy)]
struct Frame {
    return_ip: usize,
    frame_pointer: usize,
}

enum Arith {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulus,
}

impl Arith {
    fn verb(&self) -> &'static str {
        match self {
            Arith::Add => "add",
            Arith::Subtract => "subtract",
            Arith::Multiply => "multiply",
            Arith::Divide => "divide",
            Arith::Modulus => "take modulus of",
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Arith::Add => "+",
            Arith::Subtract => "-",
            Arith::Multiply => "*",
            Arith::Divide => "/",
            Arith::Modulus => "%",
        }
    }
}

/// Stack virtual machine over a compiled image.  One VM drives one render;
/// the image itself is immutable and shared.
pub struct Vm<'img> {
    image: &'img Image,
    config: Config,
    hosts: HostFunctions,
    sandbox: Sandbox,
    memory: Memory<'img>,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    ip: usize,
    fp: usize,
    err: Option<RuntimeError>,
}

impl<'img> Vm<'img> {
    pub fn new(image: &'img Image) -> Self {
        Self::with_config(image, Config::default(), SandboxLimits::default())
    }

    pub fn with_config(image: &'img Image, config: Config, limits: SandboxLimits) -> Self {
        Self::with_hosts(image, config, limits, HostFunctions::standard())
    }

    pub fn with_hosts(
        image: &'img Image,
        config: Config,
        limits: SandboxLimits,
        hosts: HostFunctions,
    ) -> Self {
        let frames = Vec::with_capacity(config.max_call_frames);
        Self {
            image,
            config,
            hosts,
            sandbox: Sandbox::new(limits),
            memory: Memory::with_budget(image, limits.arena_budget_bytes),
            stack: Vec::with_capacity(64),
            frames,
            ip: image.entry_offset(),
            fp: 0,
            err: None,
        }
    }

    /// The error record of a failed run, if any.
    pub fn error(&self) -> Option<&RuntimeError> {
        self.err.as_ref()
    }

    /// Current call depth; zero while the main script runs.
    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn memory(&self) -> &Memory<'img> {
        &self.memory
    }

    pub fn memory_metrics(&self) -> &MemoryMetrics {
        self.memory.metrics()
    }

    pub fn sandbox_metrics(&self) -> SandboxMetrics {
        self.sandbox.metrics()
    }

    /// Execute from the image's entry offset until the main script returns,
    /// writing `PRINT` output to `out`.
    pub fn run(&mut self, out: &mut dyn Write) -> Result<Value, RuntimeError> {
        let result = self.execute(out);
        if let Err(error) = &result {
            self.err = Some(error.clone());
        }
        result
    }

    fn execute(&mut self, out: &mut dyn Write) -> Result<Value, RuntimeError> {
        loop {
            self.sandbox.tick()?;
            let code = self.image.code();
            if self.ip >= code.len() {
                // Running off the end of the code section behaves as an
                // implicit return of null.
                if let Some(final_value) = self.unwind(Value::Null)? {
                    return Ok(final_value);
                }
                continue;
            }
            let byte = code[self.ip];
            self.ip += 1;
            let op = Opcode::decode(byte).ok_or_else(|| {
                RuntimeError::Malformed(format!("unknown opcode {byte} at offset {}", self.ip - 1))
            })?;
            match op {
                Opcode::Pop => {
                    let value = self.pop()?;
                    self.memory.release(value);
                }
                Opcode::ConstantI64 => {
                    let value = self.read_i64()?;
                    self.push(Value::Int(value))?;
                }
                Opcode::ConstantF64 => {
                    let value = self.read_f64()?;
                    self.push(Value::Float(value))?;
                }
                Opcode::ConstantBool => {
                    let raw = self.read_u8()?;
                    self.push(Value::Bool(raw != 0))?;
                }
                Opcode::ConstantString => {
                    let offset = self.read_u32()? as usize;
                    let text = self.memory.data_str(offset).ok_or_else(|| {
                        RuntimeError::Malformed(format!(
                            "string literal at data offset {offset} is truncated"
                        ))
                    })?;
                    self.push(Value::Str(text))?;
                }
                Opcode::ConstantNull => {
                    self.push(Value::Null)?;
                }
                Opcode::GetLocal => {
                    let slot = self.read_local()?;
                    let value = self.local(slot)?;
                    self.memory.retain(value);
                    self.push(value)?;
                }
                Opcode::SetLocal => {
                    let slot = self.read_local()?;
                    let index = self.local_index(slot)?;
                    let top = *self.stack.last().ok_or_else(|| {
                        RuntimeError::Malformed("SET_LOCAL on an empty stack".to_string())
                    })?;
                    // Assignment is an expression: the value stays on the
                    // stack, so the slot takes its own reference.
                    self.memory.retain(top);
                    let old = std::mem::replace(&mut self.stack[index], top);
                    self.memory.release(old);
                }
                Opcode::Incr => {
                    let raw = self.read_u8()?;
                    let slot = self.read_local()?;
                    let delta = if raw == 0 { -1 } else { raw as i64 };
                    let index = self.local_index(slot)?;
                    let updated = match self.stack[index] {
                        Value::Int(current) => Value::Int(current.wrapping_add(delta)),
                        other => {
                            return Err(RuntimeError::Type(format!(
                                "Cannot increment non-integer value: {}",
                                describe(&self.memory, other)
                            )))
                        }
                    };
                    self.stack[index] = updated;
                    self.push(updated)?;
                }
                Opcode::Add => self.arithmetic(Arith::Add)?,
                Opcode::Subtract => self.arithmetic(Arith::Subtract)?,
                Opcode::Multiply => self.arithmetic(Arith::Multiply)?,
                Opcode::Divide => self.arithmetic(Arith::Divide)?,
                Opcode::Modulus => self.arithmetic(Arith::Modulus)?,
                Opcode::Negate => {
                    let value = self.pop()?;
                    let negated = match value {
                        Value::Int(v) => Value::Int(v.wrapping_neg()),
                        Value::Float(v) => Value::Float(-v),
                        other => {
                            return Err(RuntimeError::Type(format!(
                                "Cannot negate non-numeric value: {}",
                                describe(&self.memory, other)
                            )))
                        }
                    };
                    self.push(negated)?;
                }
                Opcode::Not => {
                    let value = self.pop()?;
                    let negated = match value {
                        Value::Bool(v) => Value::Bool(!v),
                        other => {
                            return Err(RuntimeError::Type(format!(
                                "Cannot negate non-boolean value: {}",
                                describe(&self.memory, other)
                            )))
                        }
                    };
                    self.push(negated)?;
                }
                Opcode::Equal => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let result = match equal(&self.memory, a, b) {
                        Ok(result) => result,
                        Err(Incompatible) => {
                            return Err(RuntimeError::Type(format!(
                                "Cannot test equality of {} and {}",
                                a.kind(&self.memory),
                                b.kind(&self.memory)
                            )))
                        }
                    };
                    self.memory.release(a);
                    self.memory.release(b);
                    self.push(Value::Bool(result))?;
                }
                Opcode::Greater => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let result = order(&self.memory, a, b) == Ordering::Greater;
                    self.memory.release(a);
                    self.memory.release(b);
                    self.push(Value::Bool(result))?;
                }
                Opcode::Lesser => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let result = order(&self.memory, a, b) == Ordering::Less;
                    self.memory.release(a);
                    self.memory.release(b);
                    self.push(Value::Bool(result))?;
                }
                Opcode::Jump => {
                    let offset = self.read_i16()?;
                    self.branch(offset)?;
                }
                Opcode::JumpIfFalse => {
                    let offset = self.read_i16()?;
                    let top = *self.stack.last().ok_or_else(|| {
                        RuntimeError::Malformed("JUMP_IF_FALSE on an empty stack".to_string())
                    })?;
                    // The condition stays on the stack; the compiler emits
                    // an explicit POP where one is needed.
                    if !top.is_true() {
                        self.branch(offset)?;
                    }
                }
                Opcode::InitializeArray => {
                    let count = self.read_u32()? as usize;
                    if count > self.stack.len() {
                        return Err(RuntimeError::Malformed(format!(
                            "INITIALIZE_ARRAY of {count} values with {} on the stack",
                            self.stack.len()
                        )));
                    }
                    let items = self.stack.split_off(self.stack.len() - count);
                    let list = self.memory.alloc(HeapObject::List(items))?;
                    self.push(Value::Ref(list))?;
                }
                Opcode::IndexGet => {
                    let index = self.pop()?;
                    let target = self.pop()?;
                    let result = self.index_get(target, index)?;
                    self.memory.release(target);
                    self.memory.release(index);
                    self.push(result)?;
                }
                Opcode::Call => {
                    let offset = self.read_u32()? as usize;
                    let descriptor =
                        read_function(self.image.data(), offset).ok_or_else(|| {
                            RuntimeError::Malformed(format!(
                                "function descriptor at data offset {offset} is truncated"
                            ))
                        })?;
                    if self.frames.len() >= self.config.max_call_frames {
                        return Err(RuntimeError::StackOverflow(format!(
                            "call depth exceeds {} frames",
                            self.config.max_call_frames
                        )));
                    }
                    let arity = descriptor.arity as usize;
                    if arity > self.stack.len() {
                        return Err(RuntimeError::Malformed(format!(
                            "call with arity {arity} but {} values on the stack",
                            self.stack.len()
                        )));
                    }
                    if descriptor.code_offset >= self.image.code().len() {
                        return Err(RuntimeError::Malformed(format!(
                            "function entry {} outside the code section",
                            descriptor.code_offset
                        )));
                    }
                    self.frames.push(Frame {
                        return_ip: self.ip,
                        frame_pointer: self.fp,
                    });
                    self.sandbox.record_frame_depth(self.frames.len());
                    self.fp = self.stack.len() - arity;
                    self.ip = descriptor.code_offset;
                }
                Opcode::CallHost => {
                    let id = self.read_u32()?;
                    let argc = self.read_u8()? as usize;
                    if argc > self.stack.len() {
                        return Err(RuntimeError::Malformed(format!(
                            "host call with {argc} arguments but {} values on the stack",
                            self.stack.len()
                        )));
                    }
                    let args = self.stack.split_off(self.stack.len() - argc);
                    let result = self.hosts.call(id, &mut self.memory, &args)?;
                    for arg in args {
                        self.memory.release(arg);
                    }
                    self.push(result)?;
                }
                Opcode::Return => {
                    let value = self.pop()?;
                    if let Some(final_value) = self.unwind(value)? {
                        return Ok(final_value);
                    }
                }
                Opcode::Print => {
                    let value = self.pop()?;
                    write_value(out, &self.memory, value, self.config.escape_by_default)
                        .map_err(|error: io::Error| RuntimeError::Output(error.to_string()))?;
                    self.memory.release(value);
                }
                Opcode::Debug => {
                    let at = self.ip;
                    let length = self.read_u16()? as usize;
                    if length < 2 || at + length > self.image.code().len() {
                        return Err(RuntimeError::Malformed(format!(
                            "debug record of {length} bytes at offset {at} is truncated"
                        )));
                    }
                    // The stored length covers its own two prefix bytes.
                    self.ip = at + length;
                }
            }
        }
    }

    /// Pop a frame after a return.  `Some` carries the final value once the
    /// main script itself returns.
    fn unwind(&mut self, value: Value) -> Result<Option<Value>, RuntimeError> {
        let Some(frame) = self.frames.pop() else {
            return Ok(Some(value));
        };
        // Truncating to the frame pointer erases the parameters and locals
        // of the returning function.
        while self.stack.len() > self.fp {
            let dead = self.stack.pop().unwrap_or(Value::Null);
            self.memory.release(dead);
        }
        self.ip = frame.return_ip;
        self.fp = frame.frame_pointer;
        self.push(value)?;
        Ok(None)
    }

    fn arithmetic(&mut self, op: Arith) -> Result<(), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        let result = match (a, b) {
            (Value::Int(x), Value::Int(y)) => match op {
                Arith::Add => Value::Int(x.wrapping_add(y)),
                Arith::Subtract => Value::Int(x.wrapping_sub(y)),
                Arith::Multiply => Value::Int(x.wrapping_mul(y)),
                Arith::Divide => {
                    if y == 0 {
                        return Err(self.zero_divisor_error(&op, a, b));
                    }
                    Value::Int(x.wrapping_div(y))
                }
                Arith::Modulus => {
                    if y == 0 {
                        return Err(self.zero_divisor_error(&op, a, b));
                    }
                    Value::Int(floor_mod(x, y))
                }
            },
            (Value::Int(_), Value::Float(_))
            | (Value::Float(_), Value::Int(_))
            | (Value::Float(_), Value::Float(_)) => {
                // MODULUS is integer-only; everything else promotes.
                if matches!(op, Arith::Modulus) {
                    return Err(self.arith_error(&op, a, b));
                }
                let x = promote(a);
                let y = promote(b);
                Value::Float(match op {
                    Arith::Add => x + y,
                    Arith::Subtract => x - y,
                    Arith::Multiply => x * y,
                    Arith::Divide => x / y,
                    Arith::Modulus => unreachable!("modulus rejected above"),
                })
            }
            _ => return Err(self.arith_error(&op, a, b)),
        };
        self.push(result)
    }

    fn arith_error(&self, op: &Arith, a: Value, b: Value) -> RuntimeError {
        let numeric = |v: Value| matches!(v, Value::Int(_) | Value::Float(_));
        let detail = if matches!(op, Arith::Modulus) && numeric(a) && numeric(b) {
            "non-integer value"
        } else {
            "non-numeric value"
        };
        RuntimeError::Type(format!(
            "Cannot {} {}: {} {} {}",
            op.verb(),
            detail,
            describe(&self.memory, a),
            op.symbol(),
            describe(&self.memory, b)
        ))
    }

    fn zero_divisor_error(&self, op: &Arith, a: Value, b: Value) -> RuntimeError {
        let verb = match op {
            Arith::Modulus => "take modulus",
            _ => "divide",
        };
        RuntimeError::Type(format!(
            "Cannot {} by zero: {} {} {}",
            verb,
            describe(&self.memory, a),
            op.symbol(),
            describe(&self.memory, b)
        ))
    }

    fn index_get(&mut self, target: Value, index: Value) -> Result<Value, RuntimeError> {
        enum Fetched {
            Ready(Value),
            Retain(Value),
            PoolByte(u8),
        }
        let fetched = match target {
            Value::Str(text) => {
                let position = self.scalar_index(index, text.len(), target)?;
                Fetched::Ready(Value::Str(text.byte_at(position as u32)))
            }
            Value::Ref(handle) => match self.memory.object(handle)? {
                HeapObject::Buffer(bytes) => {
                    let len = bytes.len();
                    let byte = {
                        let position = self.scalar_index(index, len, target)?;
                        self.buffer_byte(handle, position)?
                    };
                    Fetched::PoolByte(byte)
                }
                HeapObject::List(items) => {
                    let len = items.len();
                    let position = self.scalar_index(index, len, target)?;
                    let item = self.list_item(handle, position)?;
                    Fetched::Retain(item)
                }
                HeapObject::Map(_) => {
                    let found = match index {
                        Value::Int(v) => self.memory.map_get(handle, KeyRef::Int(v))?,
                        other => match self.memory.text_of(other) {
                            Some(bytes) => self.memory.map_get(handle, KeyRef::Str(bytes))?,
                            None => {
                                return Err(RuntimeError::Type(format!(
                                    "Cannot index map with {} key: {}",
                                    other.kind(&self.memory),
                                    describe(&self.memory, other)
                                )))
                            }
                        },
                    };
                    match found {
                        Some(item) => Fetched::Retain(item),
                        None => Fetched::Ready(Value::Null),
                    }
                }
                other => {
                    return Err(RuntimeError::Type(format!(
                        "Cannot index {} value",
                        other.kind()
                    )))
                }
            },
            other => {
                return Err(RuntimeError::Type(format!(
                    "Cannot index {} value",
                    other.kind(&self.memory)
                )))
            }
        };
        Ok(match fetched {
            Fetched::Ready(value) => value,
            Fetched::Retain(value) => {
                self.memory.retain(value);
                value
            }
            Fetched::PoolByte(byte) => Value::Str(self.memory.intern(&[byte])?),
        })
    }

    fn scalar_index(
        &self,
        index: Value,
        len: usize,
        target: Value,
    ) -> Result<usize, RuntimeError> {
        let raw = match index {
            Value::Int(v) => v,
            other => {
                return Err(RuntimeError::Type(format!(
                    "Cannot index {} with non-integer value: {}",
                    target.kind(&self.memory),
                    describe(&self.memory, other)
                )))
            }
        };
        // Negative indices count from the end; -1 addresses the last slot.
        let resolved = if raw < 0 { raw + len as i64 } else { raw };
        if resolved < 0 || resolved >= len as i64 {
            return Err(RuntimeError::OutOfRange(format!(
                "index {raw} out of range for length {len}"
            )));
        }
        Ok(resolved as usize)
    }

    fn buffer_byte(&self, handle: HeapRef, at: usize) -> Result<u8, RuntimeError> {
        match self.memory.object(handle)? {
            HeapObject::Buffer(bytes) => bytes.get(at).copied().ok_or_else(|| {
                RuntimeError::OutOfRange(format!(
                    "index {at} out of range for length {}",
                    bytes.len()
                ))
            }),
            _ => Err(RuntimeError::Malformed("buffer handle went stale".to_string())),
        }
    }

    fn list_item(&self, handle: HeapRef, at: usize) -> Result<Value, RuntimeError> {
        match self.memory.object(handle)? {
            HeapObject::List(items) => items.get(at).copied().ok_or_else(|| {
                RuntimeError::OutOfRange(format!(
                    "index {at} out of range for length {}",
                    items.len()
                ))
            }),
            _ => Err(RuntimeError::Malformed("list handle went stale".to_string())),
        }
    }

    fn local(&self, slot: usize) -> Result<Value, RuntimeError> {
        let index = self.local_index(slot)?;
        Ok(self.stack[index])
    }

    fn local_index(&self, slot: usize) -> Result<usize, RuntimeError> {
        let index = self.fp + slot;
        if index >= self.stack.len() {
            return Err(RuntimeError::Malformed(format!(
                "local slot {slot} outside the current frame"
            )));
        }
        Ok(index)
    }

    fn branch(&mut self, offset: i16) -> Result<(), RuntimeError> {
        // Offsets are measured from the byte after the 16-bit operand.
        let target = self.ip as i64 + offset as i64;
        if target < 0 || target > self.image.code().len() as i64 {
            return Err(RuntimeError::Malformed(format!(
                "branch target {target} outside the code section"
            )));
        }
        self.ip = target as usize;
        Ok(())
    }

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        self.stack.push(value);
        self.sandbox.record_stack_depth(self.stack.len())?;
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack
            .pop()
            .ok_or_else(|| RuntimeError::Malformed("operand stack underflow".to_string()))
    }

    fn read_u8(&mut self) -> Result<u8, RuntimeError> {
        let byte = self
            .image
            .code()
            .get(self.ip)
            .copied()
            .ok_or_else(|| self.overrun())?;
        self.ip += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16, RuntimeError> {
        Ok(u16::from_le_bytes(self.read_array::<2>()?))
    }

    fn read_i16(&mut self) -> Result<i16, RuntimeError> {
        Ok(i16::from_le_bytes(self.read_array::<2>()?))
    }

    fn read_u32(&mut self) -> Result<u32, RuntimeError> {
        Ok(u32::from_le_bytes(self.read_array::<4>()?))
    }

    fn read_i64(&mut self) -> Result<i64, RuntimeError> {
        Ok(i64::from_le_bytes(self.read_array::<8>()?))
    }

    fn read_f64(&mut self) -> Result<f64, RuntimeError> {
        Ok(f64::from_le_bytes(self.read_array::<8>()?))
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], RuntimeError> {
        let code = self.image.code();
        let slice = code.get(self.ip..self.ip + N).ok_or_else(|| self.overrun())?;
        let mut raw = [0u8; N];
        raw.copy_from_slice(slice);
        self.ip += N;
        Ok(raw)
    }

    fn read_local(&mut self) -> Result<usize, RuntimeError> {
        if self.config.local_width() == 1 {
            Ok(self.read_u8()? as usize)
        } else {
            Ok(self.read_u16()? as usize)
        }
    }

    fn overrun(&self) -> RuntimeError {
        RuntimeError::Malformed(format!(
            "operand at offset {} overruns the code section",
            self.ip
        ))
    }
}

/// Floor modulus: the result takes the sign of the divisor.
fn floor_mod(a: i64, b: i64) -> i64 {
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) {
        r + b
    } else {
        r
    }
}

fn promote(value: Value) -> f64 {
    match value {
        Value::Int(v) => v as f64,
        Value::Float(v) => v,
        _ => 0.0,
    }
}
