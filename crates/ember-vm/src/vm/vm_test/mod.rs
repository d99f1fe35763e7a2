// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for the virtual machine.

#![allow(clippy::unwrap_used, clippy::expect_used)]


pub use super::{ExecError, NativeError, Vm};
pub use crate::bytecode::{
    WORD_OCTETS, Word, const_kind, encode, encode_a, encode_ab, encode_abc, encode_long,
    encode_mid, funchdr, locsym, op, pack_name, upval, words_for_octets,
};
pub use crate::value::{Function, Value};
pub use std::rc::Rc;

/// Hand assembler for top-level program images: the compiler stand-in.
///
/// Word offsets are absolute (header included), so [`Asm::here`] values
/// can be used directly for function entries and jump targets.
pub struct Asm {
    argc: u8,
    nregs: u8,
    body: Vec<Word>,
    syms: Vec<Word>,
    nsyms: usize,
}

/// Patch handle for an embedded nested function.
pub struct FnHandle {
    header: usize,
}

impl Asm {
    /// Start a program image; `argc`/`nregs` describe the top-level body.
    pub fn new(argc: u8, nregs: u8) -> Self {
        Self {
            argc,
            nregs,
            body: Vec::new(),
            syms: Vec::new(),
            nsyms: 0,
        }
    }

    /// Absolute word offset of the next emitted word.
    pub fn here(&self) -> usize {
        funchdr::LEN + self.body.len()
    }

    /// Emit one raw instruction word.
    pub fn emit(&mut self, word: Word) -> &mut Self {
        self.body.push(word);
        self
    }

    /// Emit `RET reg`.
    pub fn ret(&mut self, reg: u8) -> &mut Self {
        self.emit(encode_a(op::RET, reg))
    }

    /// Emit an integer constant load.
    pub fn ldconst_int(&mut self, dst: u8, value: i64) -> &mut Self {
        self.emit(encode_ab(op::LDCONST, dst, const_kind::INT));
        self.body.push(value as Word);
        self
    }

    /// Emit a float constant load.
    pub fn ldconst_float(&mut self, dst: u8, value: f64) -> &mut Self {
        self.emit(encode_ab(op::LDCONST, dst, const_kind::FLOAT));
        self.body.push(value.to_bits());
        self
    }

    /// Emit a payload-free constant load (nil/true/false).
    pub fn ldconst(&mut self, dst: u8, kind: u8) -> &mut Self {
        self.emit(encode_ab(op::LDCONST, dst, kind))
    }

    /// Emit `LDSYM dst, sym`.
    pub fn ldsym(&mut self, dst: u8, sym: u16) -> &mut Self {
        self.emit(encode_mid(op::LDSYM, dst, sym))
    }

    /// Emit a call with its packed argument register indices.
    pub fn call(&mut self, dst: u8, func: u8, args: &[u8]) -> &mut Self {
        self.emit(encode_abc(op::CALL, dst, func, args.len() as u8));
        let mut words = vec![0 as Word; words_for_octets(args.len())];
        for (i, reg) in args.iter().enumerate() {
            words[i / WORD_OCTETS] |= u64::from(*reg) << ((i % WORD_OCTETS) * 8);
        }
        self.body.extend_from_slice(&words);
        self
    }

    /// Emit a jump instruction with a zero offset; returns the offset
    /// word's position for [`Asm::patch`].
    pub fn jump(&mut self, ins: Word) -> usize {
        self.emit(ins);
        let pos = self.here();
        self.body.push(0);
        pos
    }

    /// Patch a forward jump to land at the current position.
    pub fn patch(&mut self, offset_pos: usize) {
        let offset = self.here() as i64 - (offset_pos as i64 + 1);
        self.body[offset_pos - funchdr::LEN] = offset as Word;
    }

    /// Emit a jump landing at an already-known (backward) target.
    pub fn jump_to(&mut self, ins: Word, target: usize) -> &mut Self {
        self.emit(ins);
        let offset = target as i64 - (self.here() as i64 + 1);
        self.body.push(offset as Word);
        self
    }

    /// Emit `GLBVAL src` with the global's name payload.
    pub fn glbval(&mut self, src: u8, name: &str) -> &mut Self {
        self.emit(encode_mid(op::GLBVAL, src, name.len() as u16));
        self.body.extend_from_slice(&pack_name(name));
        self
    }

    /// Begin an embedded nested function: emits the skip instruction and
    /// the function header. The body length is patched by
    /// [`Asm::end_function`].
    pub fn begin_function(&mut self, argc: u8, nregs: u8) -> FnHandle {
        self.emit(encode(op::FUNCTION));
        let header = self.here();
        self.body
            .extend_from_slice(&[0, 0, Word::from(argc), Word::from(nregs)]);
        FnHandle { header }
    }

    /// Close an embedded nested function; returns its header offset (the
    /// entry recorded in `FUNCDEF` symbols).
    pub fn end_function(&mut self, handle: FnHandle) -> usize {
        let bodylen = self.here() - (handle.header + funchdr::LEN);
        self.body[handle.header - funchdr::LEN + funchdr::IDX_BODYLEN] = bodylen as Word;
        handle.header
    }

    /// Add a string constant record; returns its symbol index.
    pub fn sym_string(&mut self, text: &str) -> u16 {
        self.syms.push(encode_long(locsym::STRCONST, text.len() as u64));
        self.syms.extend_from_slice(&pack_name(text));
        self.next_sym()
    }

    /// Add a symbol stub record; returns its symbol index.
    pub fn sym_stub(&mut self, name: &str) -> u16 {
        self.syms.push(encode_long(locsym::SYMSTUB, name.len() as u64));
        self.syms.extend_from_slice(&pack_name(name));
        self.next_sym()
    }

    /// Add a function definition record; returns its symbol index.
    pub fn sym_funcdef(&mut self, name: &str, entry: usize) -> u16 {
        self.syms.push(Word::from(locsym::FUNCDEF));
        self.syms.push(entry as Word);
        self.syms.push(name.len() as Word);
        self.syms.extend_from_slice(&pack_name(name));
        self.next_sym()
    }

    fn next_sym(&mut self) -> u16 {
        let idx = self.nsyms as u16;
        self.nsyms += 1;
        idx
    }

    /// Assemble the image into a callable top-level program value.
    pub fn build(&self, name: &str) -> Value {
        let mut code = Vec::with_capacity(funchdr::LEN + self.body.len() + self.syms.len());
        code.push(self.body.len() as Word); // symbol table offset
        code.push(self.nsyms as Word);
        code.push(Word::from(self.argc));
        code.push(Word::from(self.nregs));
        code.extend_from_slice(&self.body);
        code.extend_from_slice(&self.syms);
        Value::function(Function::top_program(name, code))
    }
}

/// Build the program as "test" and run it on a fresh VM without
/// arguments.
pub fn run(asm: &Asm) -> Result<Value, ExecError> {
    let mut vm = Vm::new();
    run_in(&mut vm, asm)
}

/// Build the program as "test" and run it on the given VM without
/// arguments.
pub fn run_in(vm: &mut Vm, asm: &Asm) -> Result<Value, ExecError> {
    let prog = asm.build("test");
    vm.call_function(&prog, &[])
}
