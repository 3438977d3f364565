//! Batched Lua value construction.
//!
//! Building a response table field by field costs one trip through the mlua
//! API per push, per table creation and per assignment. [`LuaBatch`] records
//! those operations into a flat byte buffer instead, so a background task can
//! prepare a whole result (a header table, an address list) off the event
//! loop and the loop materialises it in one straight-line pass.
//!
//! # Encoding
//!
//! Every instruction is a one-byte opcode followed by little-endian operands:
//!
//! ```text
//! NIL | TRUE | FALSE | TABLE | SET
//! INT         i64
//! NUMBER      f64 bits
//! STRING      ptr:u64 len:u32        (bytes anchored by the batch)
//! STRING_I    len:u32 bytes[len]     (bytes copied into the buffer)
//! TABLE_SIZED narr:u32 nrec:u32
//! SET_FIELD   ptr:u64 len:u32
//! SET_FIELD_I len:u32 bytes[len]
//! SET_INDEX   index:u32
//! POP         count:u8
//! ```
//!
//! By-reference strings store the data pointer of a [`Bytes`] handle directly
//! in the buffer. The batch keeps a clone of every such handle in `anchors`
//! for as long as the batch exists, and `Bytes` storage never moves, so the
//! pointer stays valid through [`LuaBatch::execute`].
//!
//! # Stack model
//!
//! Execution runs against a private value stack. `SET` expects
//! `[.., table, key, value]`, `SET_FIELD`/`SET_INDEX` expect `[.., table, value]`;
//! both pop what they consume and leave the table in place. Whatever remains
//! on the stack when the buffer is exhausted is the batch's result.
//!
//! A malformed buffer or stack misuse is a bug in the code that built the
//! batch, not a script error, so execution panics.

use bytes::Bytes;
use mlua::prelude::*;

mod op {
    pub const NIL: u8 = 0x01;
    pub const TRUE: u8 = 0x02;
    pub const FALSE: u8 = 0x03;
    pub const INT: u8 = 0x04;
    pub const NUMBER: u8 = 0x05;
    pub const STRING: u8 = 0x06;
    pub const STRING_INLINE: u8 = 0x07;
    pub const TABLE: u8 = 0x08;
    pub const TABLE_SIZED: u8 = 0x09;
    pub const SET: u8 = 0x0A;
    pub const SET_FIELD: u8 = 0x0B;
    pub const SET_FIELD_INLINE: u8 = 0x0C;
    pub const SET_INDEX: u8 = 0x0D;
    pub const POP: u8 = 0x0E;
}

/// A recorded sequence of Lua stack operations.
///
/// `LuaBatch` is `Send`: it can be filled on a tokio worker and shipped to
/// the event loop inside a resume event (see
/// [`ResumeValue::Batch`](super::events::ResumeValue::Batch)).
///
/// ```ignore
/// let mut batch = LuaBatch::new();
/// batch
///     .table_sized(0, 2)
///     .string_field("status", Bytes::from_static(b"ok"))
///     .int_field("code", 200);
/// let values = batch.execute(&lua)?; // one table
/// ```
#[derive(Clone, Default)]
pub struct LuaBatch {
    /// Opcodes, inline operands and embedded string pointers.
    buf: Vec<u8>,
    /// Keeps every by-reference string alive while the batch exists.
    anchors: Vec<Bytes>,
}

impl std::fmt::Debug for LuaBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuaBatch")
            .field("encoded_len", &self.buf.len())
            .field("anchored_strings", &self.anchors.len())
            .finish()
    }
}

impl LuaBatch {
    /// Create an empty batch with room for a typical response table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(256),
            anchors: Vec::with_capacity(16),
        }
    }

    /// Clear all instructions, keeping allocated capacity.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.anchors.clear();
    }

    /// Returns `true` if no instruction has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Size of the encoded instruction stream in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.buf.len()
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_len(&mut self, len: usize) {
        let len = u32::try_from(len).expect("lunet: batch string longer than u32::MAX");
        self.put_u32(len);
    }

    fn put_anchored(&mut self, s: Bytes) {
        let ptr = if s.is_empty() { 0 } else { s.as_ptr() as u64 };
        self.put_u64(ptr);
        self.put_len(s.len());
        self.anchors.push(s);
    }

    fn put_inline(&mut self, s: &[u8]) {
        self.put_len(s.len());
        self.buf.extend_from_slice(s);
    }

    /// Push `nil`.
    pub fn nil(&mut self) -> &mut Self {
        self.buf.push(op::NIL);
        self
    }

    /// Push a boolean.
    pub fn bool(&mut self, v: bool) -> &mut Self {
        self.buf.push(if v { op::TRUE } else { op::FALSE });
        self
    }

    /// Push an integer.
    pub fn int(&mut self, v: i64) -> &mut Self {
        self.buf.push(op::INT);
        self.put_u64(v as u64);
        self
    }

    /// Push a float.
    pub fn number(&mut self, v: f64) -> &mut Self {
        self.buf.push(op::NUMBER);
        self.put_u64(v.to_bits());
        self
    }

    /// Push a string by reference. No bytes are copied until execution.
    pub fn string(&mut self, s: impl Into<Bytes>) -> &mut Self {
        self.buf.push(op::STRING);
        self.put_anchored(s.into());
        self
    }

    /// Push a string whose bytes are copied into the instruction buffer.
    /// Cheaper than [`string`](Self::string) for short literals.
    pub fn inline_string(&mut self, s: &[u8]) -> &mut Self {
        self.buf.push(op::STRING_INLINE);
        self.put_inline(s);
        self
    }

    /// Push a new empty table.
    pub fn table(&mut self) -> &mut Self {
        self.buf.push(op::TABLE);
        self
    }

    /// Push a new table preallocated for `narr` array and `nrec` hash slots.
    pub fn table_sized(&mut self, narr: u32, nrec: u32) -> &mut Self {
        self.buf.push(op::TABLE_SIZED);
        self.put_u32(narr);
        self.put_u32(nrec);
        self
    }

    /// Pop value and key, assign `table[key] = value` on the table below them.
    pub fn set(&mut self) -> &mut Self {
        self.buf.push(op::SET);
        self
    }

    /// Pop a value and assign it to field `name` of the table below it.
    pub fn set_field(&mut self, name: impl Into<Bytes>) -> &mut Self {
        self.buf.push(op::SET_FIELD);
        self.put_anchored(name.into());
        self
    }

    /// Like [`set_field`](Self::set_field) with the name copied inline.
    pub fn set_field_inline(&mut self, name: &str) -> &mut Self {
        self.buf.push(op::SET_FIELD_INLINE);
        self.put_inline(name.as_bytes());
        self
    }

    /// Pop a value and store it at integer `index` of the table below it.
    pub fn set_index(&mut self, index: u32) -> &mut Self {
        self.buf.push(op::SET_INDEX);
        self.put_u32(index);
        self
    }

    /// Discard the top `n` stack values.
    pub fn pop(&mut self, n: u8) -> &mut Self {
        self.buf.push(op::POP);
        self.buf.push(n);
        self
    }

    /// `table.name = value` for a string value.
    pub fn string_field(&mut self, name: &str, value: impl Into<Bytes>) -> &mut Self {
        self.string(value).set_field_inline(name)
    }

    /// `table.name = value` for an integer value.
    pub fn int_field(&mut self, name: &str, value: i64) -> &mut Self {
        self.int(value).set_field_inline(name)
    }

    /// `table[key] = value` for string key and value.
    pub fn string_entry(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> &mut Self {
        self.string(key).string(value).set()
    }

    /// Resolve an embedded string reference.
    fn anchored(&self, ptr: u64, len: u32) -> &[u8] {
        if len == 0 {
            return &[];
        }
        let len = len as usize;
        debug_assert!(
            self.anchors.iter().any(|a| {
                let start = a.as_ptr() as u64;
                ptr >= start && ptr + len as u64 <= start + a.len() as u64
            }),
            "lunet: batch string pointer not anchored"
        );
        // SAFETY: `ptr`/`len` were written by `put_anchored` from a `Bytes`
        // that is still held in `self.anchors`; `Bytes` storage is immutable
        // and never relocates, and `&self` keeps the anchor alive for the
        // lifetime of the returned slice.
        unsafe { std::slice::from_raw_parts(ptr as usize as *const u8, len) }
    }

    /// Run every recorded instruction against `lua` and return the values
    /// left on the batch stack, bottom first.
    ///
    /// # Errors
    ///
    /// Only Lua allocation failures are reported as errors.
    ///
    /// # Panics
    ///
    /// Panics on an unknown opcode, a truncated operand, stack underflow, or
    /// a `SET*` instruction without a table beneath its operands.
    pub fn execute(&self, lua: &Lua) -> LuaResult<Vec<LuaValue>> {
        let mut stack: Vec<LuaValue> = Vec::new();
        let mut reader = Reader {
            buf: &self.buf,
            pos: 0,
        };

        while let Some(opcode) = reader.opcode() {
            match opcode {
                op::NIL => stack.push(LuaValue::Nil),
                op::TRUE => stack.push(LuaValue::Boolean(true)),
                op::FALSE => stack.push(LuaValue::Boolean(false)),
                op::INT => stack.push(LuaValue::Integer(reader.u64() as i64)),
                op::NUMBER => stack.push(LuaValue::Number(f64::from_bits(reader.u64()))),
                op::STRING => {
                    let (ptr, len) = (reader.u64(), reader.u32());
                    let s = lua.create_string(self.anchored(ptr, len))?;
                    stack.push(LuaValue::String(s));
                }
                op::STRING_INLINE => {
                    let s = lua.create_string(reader.inline())?;
                    stack.push(LuaValue::String(s));
                }
                op::TABLE => stack.push(LuaValue::Table(lua.create_table()?)),
                op::TABLE_SIZED => {
                    let (narr, nrec) = (reader.u32(), reader.u32());
                    let table = lua.create_table_with_capacity(narr as usize, nrec as usize)?;
                    stack.push(LuaValue::Table(table));
                }
                op::SET => {
                    let value = pop(&mut stack);
                    let key = pop(&mut stack);
                    top_table(&stack).raw_set(key, value)?;
                }
                op::SET_FIELD => {
                    let (ptr, len) = (reader.u64(), reader.u32());
                    let value = pop(&mut stack);
                    let name = lua.create_string(self.anchored(ptr, len))?;
                    top_table(&stack).raw_set(name, value)?;
                }
                op::SET_FIELD_INLINE => {
                    let name = lua.create_string(reader.inline())?;
                    let value = pop(&mut stack);
                    top_table(&stack).raw_set(name, value)?;
                }
                op::SET_INDEX => {
                    let index = i64::from(reader.u32());
                    let value = pop(&mut stack);
                    top_table(&stack).raw_set(index, value)?;
                }
                op::POP => {
                    for _ in 0..reader.u8() {
                        pop(&mut stack);
                    }
                }
                other => panic!(
                    "lunet: malformed batch opcode 0x{other:02x} at offset {}",
                    reader.pos - 1
                ),
            }
        }

        Ok(stack)
    }
}

fn pop(stack: &mut Vec<LuaValue>) -> LuaValue {
    stack.pop().expect("lunet: batch stack underflow")
}

fn top_table(stack: &[LuaValue]) -> &LuaTable {
    match stack.last() {
        Some(LuaValue::Table(table)) => table,
        _ => panic!("lunet: batch assignment without a table beneath its operands"),
    }
}

/// Cursor over an encoded instruction stream.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn opcode(&mut self) -> Option<u8> {
        let byte = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    fn take(&mut self, n: usize) -> &'a [u8] {
        let end = self.pos + n;
        assert!(
            end <= self.buf.len(),
            "lunet: truncated batch operand at offset {}",
            self.pos
        );
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        bytes
    }

    fn u8(&mut self) -> u8 {
        self.take(1)[0]
    }

    fn u32(&mut self) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4));
        u32::from_le_bytes(raw)
    }

    fn u64(&mut self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8));
        u64::from_le_bytes(raw)
    }

    fn inline(&mut self) -> &'a [u8] {
        let len = self.u32() as usize;
        self.take(len)
    }
}
