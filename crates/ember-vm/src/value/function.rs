// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Function heap types.
//!
//! A function value is one of:
//!
//! - a **native** function implemented by the host,
//! - a **script** function: an entry offset into the bytecode image of the
//!   program that defines it,
//! - a **closure**: a script prototype paired with captured upvalues.
//!
//! The bytecode image and lazily parsed local symbol table of a top-level
//! program are shared between the program and every function it defines
//! through [`Program`].

use super::Value;
use crate::bytecode::{Word, funchdr};
use crate::vm::NativeFn;
use core::cell::{Cell, RefCell};
use core::fmt;
use std::rc::Rc;

/// A compiled program image: bytecode plus its lazily parsed local symbol
/// table.
///
/// Every function defined by a top-level program holds a handle to the
/// same `Program`, so symbol resolutions memoized by one function are seen
/// by all of them.
pub struct Program {
    name: Rc<str>,
    code: Vec<Word>,
    symtab: RefCell<Vec<SymtabSlot>>,
    symtab_read: Cell<bool>,
}

impl Program {
    /// Wrap a compiled bytecode image.
    #[must_use]
    pub fn new(name: &str, code: Vec<Word>) -> Self {
        Self {
            name: name.into(),
            code,
            symtab: RefCell::new(Vec::new()),
            symtab_read: Cell::new(false),
        }
    }

    /// The program name (used in stack traces for the top-level frame).
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bytecode image.
    #[inline]
    #[must_use]
    pub fn code(&self) -> &[Word] {
        &self.code
    }

    /// Whether the local symbol table has been parsed already.
    #[inline]
    #[must_use]
    pub(crate) fn symtab_read(&self) -> bool {
        self.symtab_read.get()
    }

    /// Install the parsed local symbol table; one-shot.
    pub(crate) fn set_symtab(&self, slots: Vec<SymtabSlot>) {
        debug_assert!(!self.symtab_read.get());
        *self.symtab.borrow_mut() = slots;
        self.symtab_read.set(true);
    }

    /// Clone the symbol table slot at `idx`.
    #[must_use]
    pub(crate) fn symtab_slot(&self, idx: usize) -> Option<SymtabSlot> {
        self.symtab.borrow().get(idx).cloned()
    }

    /// Memoize a resolved value into the symbol table slot at `idx`.
    pub(crate) fn symtab_store(&self, idx: usize, value: Value) {
        self.symtab.borrow_mut()[idx] = SymtabSlot::Value(value);
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Program({:?}, {} words)", self.name, self.code.len())
    }
}

/// One entry of a program's local symbol table.
///
/// Function definitions stay as lightweight records; `LDSYM` materializes
/// them into function values bound to the owning program. This keeps the
/// symbol table from owning values that own the program.
#[derive(Clone, Debug)]
pub enum SymtabSlot {
    /// A ready value: string constant, resolved global, or memoized
    /// symbol stub resolution.
    Value(Value),
    /// A function defined by the program at the given header offset.
    FuncDef {
        /// The function's declared name.
        name: Rc<str>,
        /// Word offset of the function header within the program image.
        entry: usize,
    },
}

/// A callable Ember value.
pub struct Function {
    name: Rc<str>,
    kind: FnKind,
}

enum FnKind {
    Native(NativeFn),
    Script {
        program: Rc<Program>,
        entry: usize,
        topprg: bool,
    },
    Closure {
        proto: Rc<Function>,
        upvalues: RefCell<Vec<Value>>,
    },
}

impl Function {
    /// Create a native function.
    #[must_use]
    pub fn native(name: &str, func: NativeFn) -> Self {
        Self {
            name: name.into(),
            kind: FnKind::Native(func),
        }
    }

    /// Create the top-level program function for a compiled image. Its
    /// entry is the start of the image; the local symbol table is parsed
    /// on first execution.
    #[must_use]
    pub fn top_program(name: &str, code: Vec<Word>) -> Self {
        Self {
            name: name.into(),
            kind: FnKind::Script {
                program: Rc::new(Program::new(name, code)),
                entry: 0,
                topprg: true,
            },
        }
    }

    /// Create a script function defined by `program` at header offset
    /// `entry`.
    #[must_use]
    pub fn script(name: &str, entry: usize, program: &Rc<Program>) -> Self {
        Self {
            name: name.into(),
            kind: FnKind::Script {
                program: Rc::clone(program),
                entry,
                topprg: false,
            },
        }
    }

    /// Create a closure over `prototype` capturing `upvalues`.
    #[must_use]
    pub fn closure(prototype: &Rc<Self>, upvalues: Vec<Value>) -> Self {
        Self {
            name: Rc::clone(&prototype.name),
            kind: FnKind::Closure {
                proto: Rc::clone(prototype),
                upvalues: RefCell::new(upvalues),
            },
        }
    }

    /// The function's name (shown in stack traces).
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if this is a native function.
    #[inline]
    #[must_use]
    pub const fn is_native(&self) -> bool {
        matches!(self.kind, FnKind::Native(_))
    }

    /// Check if this is a top-level program function.
    #[inline]
    #[must_use]
    pub const fn is_top_program(&self) -> bool {
        matches!(
            self.kind,
            FnKind::Script {
                topprg: true,
                ..
            }
        )
    }

    /// The native callback, for native functions.
    #[inline]
    #[must_use]
    pub(crate) const fn native_fn(&self) -> Option<NativeFn> {
        match self.kind {
            FnKind::Native(func) => Some(func),
            FnKind::Script { .. } | FnKind::Closure { .. } => None,
        }
    }

    /// The owning program and header offset of a script function, looking
    /// through closures to their prototype.
    #[must_use]
    pub(crate) fn script_parts(&self) -> Option<(&Rc<Program>, usize)> {
        match &self.kind {
            FnKind::Script { program, entry, .. } => Some((program, *entry)),
            FnKind::Closure { proto, .. } => proto.script_parts(),
            FnKind::Native(_) => None,
        }
    }

    /// The captured upvalues of a closure.
    #[inline]
    #[must_use]
    pub(crate) const fn upvalues(&self) -> Option<&RefCell<Vec<Value>>> {
        match &self.kind {
            FnKind::Closure { upvalues, .. } => Some(upvalues),
            FnKind::Native(_) | FnKind::Script { .. } => None,
        }
    }

    /// Declared parameter count, read from the function header.
    #[must_use]
    pub(crate) fn decl_argc(&self) -> Option<usize> {
        self.header_word(funchdr::IDX_ARGC)
    }

    /// Register count, read from the function header.
    #[must_use]
    pub(crate) fn nregs(&self) -> Option<usize> {
        self.header_word(funchdr::IDX_NREGS)
    }

    fn header_word(&self, idx: usize) -> Option<usize> {
        let (program, entry) = self.script_parts()?;
        program.code().get(entry + idx).map(|w| *w as usize)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FnKind::Native(_) => write!(f, "Native({:?})", self.name),
            FnKind::Script { entry, topprg, .. } => {
                write!(f, "Script({:?}, entry {entry}, topprg {topprg})", self.name)
            }
            FnKind::Closure { upvalues, .. } => {
                write!(f, "Closure({:?}, {} upvalues)", self.name, upvalues.borrow().len())
            }
        }
    }
}

/// Function identity for language equality: script functions are the same
/// function when they share a program and entry (they may be distinct
/// materializations of one definition); closures and natives only equal
/// themselves.
pub(crate) fn same_function(a: &Rc<Function>, b: &Rc<Function>) -> bool {
    if Rc::ptr_eq(a, b) {
        return true;
    }
    match (&a.kind, &b.kind) {
        (
            FnKind::Script {
                program: pa,
                entry: ea,
                ..
            },
            FnKind::Script {
                program: pb,
                entry: eb,
                ..
            },
        ) => Rc::ptr_eq(pa, pb) && ea == eb,
        _ => false,
    }
}
