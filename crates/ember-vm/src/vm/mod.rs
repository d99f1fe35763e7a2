// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! The Ember virtual machine.
//!
//! A `Vm` owns the frame stack, the global symbol table and the last-error
//! state. Host code installs native libraries, then calls a function value;
//! the dispatcher drives the bytecode until the initial frame returns or an
//! error trips.
//!
//! Execution is strictly single-threaded: one dispatcher loop runs per VM,
//! no opcode suspends, and native callbacks are invoked synchronously on
//! the dispatcher's call stack. A native callback receives `&mut Vm` and
//! may re-enter the VM through [`Vm::call_function`].
//!
//! On a runtime error the frames are deliberately left on the stack so the
//! host can collect a backtrace; they are released lazily at the start of
//! the next host call.

#[cfg(test)]
mod vm_test;

use crate::bytecode::{
    const_kind, decode_a, decode_b, decode_c, decode_long, decode_mid, decode_opcode, funchdr,
    locsym, nth_arg_index, op, unpack_name, upval, words_for_name, words_for_octets,
};
use crate::stack::Stack;
use crate::value::{Array, Function, Program, SymtabSlot, Value};
use core::any::Any;
use core::cmp::Ordering;
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, trace};

/// Native argument buffers up to this size avoid a heap allocation.
const MAX_AUTO_ARGC: usize = 16;

/// Signature of host-implemented native functions.
///
/// The VM reference allows re-entrant script calls and access to the
/// host context. On success the returned value is transferred to the
/// caller's destination register with a single fresh reference.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value, NativeError>;

/// Failure reported by a native function.
///
/// The code must be nonzero by convention; it becomes the VM's exit code
/// for this call. Without a message the VM synthesizes
/// ``error in function `<name>` (code: <code>)``.
#[derive(Debug, Clone, Error)]
#[error("native call failed (code {code})")]
pub struct NativeError {
    /// Nonzero error code, surfaced as the exit code.
    pub code: i32,
    /// Optional custom message.
    pub message: Option<String>,
}

impl NativeError {
    /// An error carrying only a code.
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        Self {
            code,
            message: None,
        }
    }

    /// An error with a custom message.
    #[must_use]
    pub fn with_message(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }
}

/// Failure of a host call into the VM.
///
/// The message is the formatted last-error text, also retrievable from
/// [`Vm::last_error`] until the next execution overwrites it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    /// A VM-level runtime error (type error, range error, resolution
    /// error, illegal instruction, ...).
    #[error("{message}")]
    Runtime {
        /// The formatted error message.
        message: String,
    },
    /// A native callback returned a nonzero code.
    #[error("{message}")]
    Native {
        /// The callback's error code.
        code: i32,
        /// The formatted error message.
        message: String,
    },
}

impl ExecError {
    /// The conventional exit code: −1 for VM-level runtime errors, the
    /// native callback's code otherwise.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::Runtime { .. } => -1,
            Self::Native { code, .. } => *code,
        }
    }

    /// The formatted error message.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Runtime { message } | Self::Native { message, .. } => message,
        }
    }
}

/// Where `push_and_copy_args` finds the call-time arguments.
enum ArgsSource<'a> {
    /// The host supplies an argument array; return fields use the host
    /// sentinels.
    Host {
        argv: &'a [Value],
    },
    /// A script caller; argument register indices are read from the
    /// caller's instruction stream at `ip`.
    Script {
        program: &'a Rc<Program>,
        ip: usize,
        ret_addr: usize,
        caller_off: usize,
        ret_slot: usize,
    },
}

/// The Ember virtual machine.
pub struct Vm {
    stack: Stack,
    /// Global symbol table: library functions, values and script-registered
    /// globals, string-keyed. Lives as long as the VM.
    globals: Rc<Array>,
    /// Last (runtime) error message.
    errmsg: Option<String>,
    /// Sticky error flag; keeps the innermost message through unwinding.
    has_error: bool,
    /// Host context, passed through to native callbacks untouched.
    ctx: Option<Box<dyn Any>>,
}

impl Vm {
    /// Create a VM with an empty stack and global symbol table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            stack: Stack::new(),
            globals: Rc::new(Array::new()),
            errmsg: None,
            has_error: false,
            ctx: None,
        }
    }

    /// The global symbol table.
    #[inline]
    #[must_use]
    pub fn globals(&self) -> &Rc<Array> {
        &self.globals
    }

    /// Install native functions under an optional library name. With
    /// `None` the functions become globals; otherwise they are collected
    /// in an array value registered under the library name (created on
    /// first use).
    pub fn add_native_functions(&mut self, libname: Option<&str>, fns: &[(&str, NativeFn)]) {
        let storage = self.lib_storage(libname);
        for (name, func) in fns {
            storage.set_str(name, Value::function(Function::native(name, *func)));
        }
    }

    /// Install pre-built values under an optional library name; `None`
    /// makes them globals.
    pub fn add_values(&mut self, libname: Option<&str>, values: &[(&str, Value)]) {
        let storage = self.lib_storage(libname);
        for (name, value) in values {
            storage.set_str(name, value.clone());
        }
    }

    fn lib_storage(&self, libname: Option<&str>) -> Rc<Array> {
        let Some(name) = libname else {
            return Rc::clone(&self.globals);
        };
        if let Value::Array(lib) = self.globals.get_str(name) {
            return lib;
        }
        let lib = Rc::new(Array::new());
        self.globals.set_str(name, Value::Array(Rc::clone(&lib)));
        lib
    }

    /// Attach a host context reachable from native callbacks.
    pub fn set_context(&mut self, ctx: impl Any) {
        self.ctx = Some(Box::new(ctx));
    }

    /// Borrow the host context, if it is a `T`.
    #[must_use]
    pub fn context<T: Any>(&self) -> Option<&T> {
        self.ctx.as_ref().and_then(|ctx| ctx.downcast_ref())
    }

    /// Mutably borrow the host context, if it is a `T`.
    #[must_use]
    pub fn context_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.ctx.as_mut().and_then(|ctx| ctx.downcast_mut())
    }

    /// The last runtime error message, if any execution has failed.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.errmsg.as_deref()
    }

    /// Record a custom error message (native-code prefix). Used by hosts
    /// and native callbacks to inject errors; sticky like every runtime
    /// error, so an earlier message is not overwritten.
    pub fn set_error_message(&mut self, msg: &str) {
        let _ = self.runtime_error(None, msg.to_string());
    }

    /// The current stack trace: function names from the innermost frame
    /// outward. Native functions appear through their pseudo-frames.
    #[must_use]
    pub fn stack_trace(&self) -> Vec<String> {
        self.stack
            .frames()
            .map(|header| header.callee.name().to_string())
            .collect()
    }

    /// Call a function value with the given arguments.
    ///
    /// Errors leave the frames in place for [`Vm::stack_trace`]; they are
    /// unwound at the start of the next call.
    pub fn call_function(&mut self, func: &Value, args: &[Value]) -> Result<Value, ExecError> {
        // If the previous execution ended in an error, unwind what the
        // backtrace inspection left behind.
        self.clean_if_needed();

        let Value::Function(fnobj) = func else {
            return Err(self.runtime_error(None, "attempt to call non-function value".into()));
        };

        debug!(function = fnobj.name(), argc = args.len(), "host call");

        if let Some(native) = fnobj.native_fn() {
            // Pseudo-frame so the callee shows up in stack traces.
            self.stack.push_native_pseudoframe(Rc::clone(fnobj));
            return match native(self, args) {
                Ok(value) => {
                    self.stack.pop_frame();
                    Ok(value)
                }
                // The pseudo-frame stays for post-mortem traces.
                Err(err) => Err(self.native_error(fnobj.name(), &err)),
            };
        }

        // A top-level program parses its local symbol table on first
        // execution.
        if fnobj.is_top_program() {
            let Some((program, _)) = fnobj.script_parts() else {
                return Err(self.runtime_error(None, "malformed function header".into()));
            };
            let program = Rc::clone(program);
            self.read_local_symtab(&program)?;
        }

        let Some((program, entry)) = fnobj.script_parts() else {
            return Err(self.runtime_error(None, "malformed function header".into()));
        };
        let program = Rc::clone(program);
        let body = entry + funchdr::LEN;

        self.push_and_copy_args(fnobj, &ArgsSource::Host { argv: args }, args.len(), None)?;

        self.dispatch(program, body)
    }

    /// Release errored frames left for backtrace inspection and clear the
    /// sticky flag. The message stays retrievable until the next error.
    fn clean_if_needed(&mut self) {
        if self.has_error {
            self.stack.unwind();
            self.has_error = false;
        }
    }

    /// Record a runtime error and build the failure value. `addr` is the
    /// word offset of the faulting instruction in the owning program's
    /// image; `None` marks errors raised in native code. The first
    /// message sticks so the innermost error survives unwinding.
    fn runtime_error(&mut self, addr: Option<usize>, msg: String) -> ExecError {
        if !self.has_error {
            let formatted = match addr {
                Some(addr) => format!("runtime error at address {addr:#010x}: {msg}"),
                None => format!("runtime error in native code: {msg}"),
            };
            debug!(message = %formatted, "runtime error");
            self.errmsg = Some(formatted);
            self.has_error = true;
        }
        ExecError::Runtime {
            message: self.errmsg.clone().unwrap_or_default(),
        }
    }

    /// Record a native callback failure; a custom message set by the
    /// callee (through [`Vm::set_error_message`]) wins over the
    /// synthesized one.
    fn native_error(&mut self, fname: &str, err: &NativeError) -> ExecError {
        if !self.has_error {
            let body = err.message.clone().unwrap_or_else(|| {
                format!("error in function `{fname}` (code: {code})", code = err.code)
            });
            let formatted = format!("runtime error in native code: {body}");
            debug!(message = %formatted, "native error");
            self.errmsg = Some(formatted);
            self.has_error = true;
        }
        ExecError::Native {
            code: err.code,
            message: self.errmsg.clone().unwrap_or_default(),
        }
    }

    /// Look up an unresolved global. The caller memoizes the result back
    /// into the local symbol table.
    fn resolve_symbol(&mut self, addr: usize, name: &str) -> Result<Value, ExecError> {
        let resolved = self.globals.get_str(name);
        if resolved.is_nil() {
            return Err(self.runtime_error(
                Some(addr),
                format!("global `{name}` does not exist or it is nil"),
            ));
        }
        Ok(resolved)
    }

    /// Parse the local symbol table at the tail of a top-level program's
    /// bytecode. Idempotent; guarded by the program's one-shot flag.
    fn read_local_symtab(&mut self, program: &Rc<Program>) -> Result<(), ExecError> {
        if program.symtab_read() {
            return Ok(());
        }

        let code = program.code();
        let offset = code
            .get(funchdr::IDX_BODYLEN)
            .map(|w| *w as usize)
            .ok_or_else(|| self.runtime_error(None, "malformed function header".into()))?;
        let symcount = code
            .get(funchdr::IDX_SYMCNT)
            .map(|w| *w as usize)
            .ok_or_else(|| self.runtime_error(None, "malformed function header".into()))?;

        let mut stp = funchdr::LEN + offset;
        let mut slots = Vec::with_capacity(symcount);

        for _ in 0..symcount {
            let record_addr = stp;
            let Some(&record) = code.get(stp) else {
                return Err(self.runtime_error(
                    Some(record_addr),
                    "local symbol table is truncated".into(),
                ));
            };
            stp += 1;

            match decode_opcode(record) {
                locsym::STRCONST => {
                    let len = decode_long(record) as usize;
                    let Some(text) = code.get(stp..).and_then(|tail| unpack_name(tail, len))
                    else {
                        return Err(self.runtime_error(
                            Some(record_addr),
                            "malformed string constant".into(),
                        ));
                    };
                    slots.push(SymtabSlot::Value(Value::string(text)));
                    stp += words_for_name(len);
                }
                locsym::SYMSTUB => {
                    let len = decode_long(record) as usize;
                    let Some(name) = code.get(stp..).and_then(|tail| unpack_name(tail, len))
                    else {
                        return Err(self.runtime_error(
                            Some(record_addr),
                            "malformed symbol stub".into(),
                        ));
                    };
                    slots.push(SymtabSlot::Value(Value::sym_stub(&name)));
                    stp += words_for_name(len);
                }
                locsym::FUNCDEF => {
                    let (Some(&entry), Some(&namelen)) = (code.get(stp), code.get(stp + 1))
                    else {
                        return Err(self.runtime_error(
                            Some(record_addr),
                            "malformed function definition".into(),
                        ));
                    };
                    stp += 2;
                    let namelen = namelen as usize;
                    let Some(name) = code.get(stp..).and_then(|tail| unpack_name(tail, namelen))
                    else {
                        return Err(self.runtime_error(
                            Some(record_addr),
                            "malformed function definition".into(),
                        ));
                    };
                    slots.push(SymtabSlot::FuncDef {
                        name: name.into(),
                        entry: entry as usize,
                    });
                    stp += words_for_name(namelen);
                }
                kind => {
                    return Err(self.runtime_error(
                        Some(record_addr),
                        format!("illegal local symbol kind {kind:#04x}"),
                    ));
                }
            }
        }

        program.set_symtab(slots);
        debug!(
            program = program.name(),
            symbols = symcount,
            "local symbol table loaded"
        );
        Ok(())
    }

    /// Push the callee's frame and bind the call-time arguments. Shared
    /// between the host entry and the `CALL` instruction; the descriptor
    /// carries the caller-side environment.
    fn push_and_copy_args(
        &mut self,
        callee: &Rc<Function>,
        src: &ArgsSource<'_>,
        argc: usize,
        addr: Option<usize>,
    ) -> Result<(), ExecError> {
        let (Some(decl_argc), Some(nregs)) = (callee.decl_argc(), callee.nregs()) else {
            return Err(self.runtime_error(addr, "malformed function header".into()));
        };
        if decl_argc > nregs {
            return Err(self.runtime_error(addr, "malformed function header".into()));
        }

        // Fewer call arguments than formal parameters leaves the
        // unspecified ones nil from frame initialization.
        let extra_argc = argc.saturating_sub(decl_argc);

        let (ret_addr, ret_slot) = match src {
            ArgsSource::Host { .. } => (None, None),
            ArgsSource::Script {
                ret_addr, ret_slot, ..
            } => (Some(*ret_addr), Some(*ret_slot)),
        };

        self.stack.push_frame(
            nregs,
            decl_argc,
            extra_argc,
            argc,
            ret_addr,
            ret_slot,
            Rc::clone(callee),
        );

        // Declared arguments land in the first registers, the extra
        // (unnamed) ones in the variadic overflow after the locals. The
        // sources are retained: the frame owns its copies, and an argument
        // register may be reassigned from within the callee.
        for i in 0..argc {
            let value = match src {
                ArgsSource::Host { argv } => argv[i].clone(),
                ArgsSource::Script {
                    program,
                    ip,
                    caller_off,
                    ..
                } => {
                    let regidx = nth_arg_index(&program.code()[*ip..], i) as usize;
                    self.stack.value_at(caller_off - 2 - regidx).clone()
                }
            };
            let ordinal = if i < decl_argc {
                i
            } else {
                nregs + (i - decl_argc)
            };
            self.stack.set_reg(ordinal, value);
        }

        Ok(())
    }

    /// The instruction dispatcher. Runs until the initial frame returns
    /// to the host or an error trips.
    ///
    /// Destination registers are released only after the operation has
    /// computed its result, so `x = f(x)` patterns are safe. Operations
    /// that push frames save destinations as absolute stack offsets, never
    /// borrows.
    #[allow(clippy::too_many_lines)]
    fn dispatch(&mut self, mut program: Rc<Program>, mut ip: usize) -> Result<Value, ExecError> {
        loop {
            let Some(&ins) = program.code().get(ip) else {
                return Err(
                    self.runtime_error(Some(ip), "instruction pointer out of bounds".into())
                );
            };
            let addr = ip;
            ip += 1;

            let opcode = decode_opcode(ins);
            trace!(addr, opcode, "dispatch");

            match opcode {
                op::CALL => {
                    // Offsets instead of borrows: pushing the callee's
                    // frame may reallocate the stack.
                    let ret_slot = self.stack.reg_index(decode_a(ins) as usize);
                    let func = self.stack.reg(decode_b(ins) as usize).clone();
                    let argc = decode_c(ins) as usize;
                    let narggroups = words_for_octets(argc);

                    if program.code().len() < ip + narggroups {
                        return Err(
                            self.runtime_error(Some(addr), "unexpected end of bytecode".into())
                        );
                    }

                    let Value::Function(fnobj) = &func else {
                        return Err(self.runtime_error(
                            Some(addr),
                            "attempt to call non-function value".into(),
                        ));
                    };

                    if let Some(native) = fnobj.native_fn() {
                        // Gather the arguments before the pseudo-frame
                        // push; they are read from the topmost frame.
                        let heap_argv: Vec<Value>;
                        let mut auto_argv: [Value; MAX_AUTO_ARGC] =
                            [const { Value::Nil }; MAX_AUTO_ARGC];
                        let argv: &[Value] = {
                            let argwords = &program.code()[ip..];
                            if argc <= MAX_AUTO_ARGC {
                                for (i, slot) in auto_argv.iter_mut().take(argc).enumerate() {
                                    let regidx = nth_arg_index(argwords, i) as usize;
                                    *slot = self.stack.reg(regidx).clone();
                                }
                                &auto_argv[..argc]
                            } else {
                                heap_argv = (0..argc)
                                    .map(|i| {
                                        let regidx = nth_arg_index(argwords, i) as usize;
                                        self.stack.reg(regidx).clone()
                                    })
                                    .collect();
                                &heap_argv
                            }
                        };

                        self.stack.push_native_pseudoframe(Rc::clone(fnobj));

                        match native(self, argv) {
                            Ok(value) => {
                                // Released only now: the destination may
                                // be one of the arguments.
                                self.stack.set_value_at(ret_slot, value);
                                self.stack.pop_frame();
                                ip += narggroups;
                            }
                            // The pseudo-frame stays for the backtrace.
                            Err(err) => return Err(self.native_error(fnobj.name(), &err)),
                        }
                    } else {
                        // The return address is the instruction following
                        // the argument index words.
                        let ret_addr = ip + narggroups;

                        let Some((callee_prog, entry)) = fnobj.script_parts() else {
                            return Err(self
                                .runtime_error(Some(addr), "malformed function header".into()));
                        };
                        let callee_prog = Rc::clone(callee_prog);
                        let body = entry + funchdr::LEN;

                        if fnobj.is_top_program() {
                            self.read_local_symtab(&callee_prog)?;
                        }

                        let caller_off = self.stack.depth();
                        self.push_and_copy_args(
                            fnobj,
                            &ArgsSource::Script {
                                program: &program,
                                ip,
                                ret_addr,
                                caller_off,
                                ret_slot,
                            },
                            argc,
                            Some(addr),
                        )?;

                        // Kick off the callee.
                        program = callee_prog;
                        ip = body;
                    }
                }

                op::RET => {
                    // Retain the result before the pop releases the
                    // callee's registers.
                    let res = self.stack.reg(decode_a(ins) as usize).clone();
                    let header = self.stack.header();
                    let (ret_addr, ret_slot) = (header.ret_addr, header.ret_slot);

                    if let (Some(ret_addr), Some(ret_slot)) = (ret_addr, ret_slot) {
                        // Return to the script caller: transfer the value
                        // into its destination register and resume.
                        self.stack.set_value_at(ret_slot, res);
                        self.stack.pop_frame();

                        let caller = &self.stack.header().callee;
                        let Some((caller_prog, _)) = caller.script_parts() else {
                            unreachable!("script return into a native pseudo-frame");
                        };
                        program = Rc::clone(caller_prog);
                        ip = ret_addr;
                    } else {
                        // Return to the host.
                        self.stack.pop_frame();
                        return Ok(res);
                    }
                }

                op::JMP => {
                    let Some(&offset) = program.code().get(ip) else {
                        return Err(
                            self.runtime_error(Some(addr), "unexpected end of bytecode".into())
                        );
                    };
                    let target = (ip as i64 + 1).wrapping_add(offset as i64);
                    if target < 0 || target as usize > program.code().len() {
                        return Err(
                            self.runtime_error(Some(addr), "jump target out of bounds".into())
                        );
                    }
                    ip = target as usize;
                }

                op::JZE | op::JNZ => {
                    let Some(&offset) = program.code().get(ip) else {
                        return Err(
                            self.runtime_error(Some(addr), "unexpected end of bytecode".into())
                        );
                    };
                    let &Value::Bool(cond) = self.stack.reg(decode_a(ins) as usize) else {
                        return Err(self.runtime_error(
                            Some(addr),
                            "register does not contain Boolean value in conditional jump \
                             (are you trying to use non-Booleans with logical operators \
                             or in the condition of an `if`, `while` or `for` statement?)"
                                .into(),
                        ));
                    };

                    if (opcode == op::JZE && !cond) || (opcode == op::JNZ && cond) {
                        let target = (ip as i64 + 1).wrapping_add(offset as i64);
                        if target < 0 || target as usize > program.code().len() {
                            return Err(self
                                .runtime_error(Some(addr), "jump target out of bounds".into()));
                        }
                        ip = target as usize;
                    } else {
                        ip += 1;
                    }
                }

                op::EQ | op::NE => {
                    // The result is computed before the destination is
                    // touched; it may alias an operand.
                    let equal = self.stack.reg(decode_b(ins) as usize)
                        == self.stack.reg(decode_c(ins) as usize);
                    let res = if opcode == op::EQ { equal } else { !equal };
                    self.stack.set_reg(decode_a(ins) as usize, Value::bool(res));
                }

                op::LT | op::LE | op::GT | op::GE => {
                    let lhs = self.stack.reg(decode_b(ins) as usize);
                    let rhs = self.stack.reg(decode_c(ins) as usize);
                    let (lhs_type, rhs_type) = (lhs.type_name(), rhs.type_name());
                    let comparable = lhs.comparable_with(rhs);
                    let ord = lhs.compare(rhs);

                    if !comparable {
                        return Err(self.runtime_error(
                            Some(addr),
                            format!(
                                "ordered comparison of uncomparable values \
                                 of type {lhs_type} and {rhs_type}"
                            ),
                        ));
                    }

                    let res = match opcode {
                        op::LT => ord == Ordering::Less,
                        op::LE => ord != Ordering::Greater,
                        op::GT => ord == Ordering::Greater,
                        _ => ord != Ordering::Less,
                    };
                    self.stack.set_reg(decode_a(ins) as usize, Value::bool(res));
                }

                op::ADD | op::SUB | op::MUL | op::DIV => {
                    let lhs = self.stack.reg(decode_b(ins) as usize);
                    let rhs = self.stack.reg(decode_c(ins) as usize);
                    let res = match arith_op(lhs, rhs, opcode) {
                        Ok(res) => res,
                        Err(msg) => return Err(self.runtime_error(Some(addr), msg.into())),
                    };
                    self.stack.set_reg(decode_a(ins) as usize, res);
                }

                op::MOD => {
                    let lhs = self.stack.reg(decode_b(ins) as usize);
                    let rhs = self.stack.reg(decode_c(ins) as usize);
                    let (Value::Int(a), Value::Int(b)) = (lhs, rhs) else {
                        return Err(self.runtime_error(
                            Some(addr),
                            "modulo division on non-integers".into(),
                        ));
                    };
                    if *b == 0 {
                        return Err(
                            self.runtime_error(Some(addr), "modulo division by zero".into())
                        );
                    }
                    let res = Value::int(a.wrapping_rem(*b));
                    self.stack.set_reg(decode_a(ins) as usize, res);
                }

                op::NEG => {
                    let res = match self.stack.reg(decode_b(ins) as usize) {
                        Value::Int(n) => Value::int(n.wrapping_neg()),
                        Value::Float(x) => Value::float(-x),
                        _ => {
                            return Err(
                                self.runtime_error(Some(addr), "negation of non-number".into())
                            );
                        }
                    };
                    self.stack.set_reg(decode_a(ins) as usize, res);
                }

                op::INC | op::DEC => {
                    let delta: i64 = if opcode == op::INC { 1 } else { -1 };
                    let updated = match self.stack.reg(decode_a(ins) as usize) {
                        Value::Int(n) => Value::int(n.wrapping_add(delta)),
                        Value::Float(x) => Value::float(x + delta as f64),
                        _ => {
                            return Err(self.runtime_error(
                                Some(addr),
                                "incrementing or decrementing non-number".into(),
                            ));
                        }
                    };
                    self.stack.set_reg(decode_a(ins) as usize, updated);
                }

                op::AND | op::OR | op::XOR | op::SHL | op::SHR => {
                    let lhs = self.stack.reg(decode_b(ins) as usize);
                    let rhs = self.stack.reg(decode_c(ins) as usize);
                    let (Value::Int(a), Value::Int(b)) = (lhs, rhs) else {
                        return Err(self.runtime_error(
                            Some(addr),
                            "bitwise operation on non-integers".into(),
                        ));
                    };
                    let res = bitwise_op(*a, *b, opcode);
                    self.stack.set_reg(decode_a(ins) as usize, Value::int(res));
                }

                op::BITNOT => {
                    let Value::Int(n) = self.stack.reg(decode_b(ins) as usize) else {
                        return Err(
                            self.runtime_error(Some(addr), "bitwise NOT on non-integer".into())
                        );
                    };
                    let res = Value::int(!*n);
                    self.stack.set_reg(decode_a(ins) as usize, res);
                }

                op::LOGNOT => {
                    let Value::Bool(b) = self.stack.reg(decode_b(ins) as usize) else {
                        return Err(self.runtime_error(
                            Some(addr),
                            "logical negation of non-Boolean value".into(),
                        ));
                    };
                    let res = Value::bool(!*b);
                    self.stack.set_reg(decode_a(ins) as usize, res);
                }

                op::SIZEOF => {
                    let res = match self.stack.reg(decode_b(ins) as usize) {
                        Value::String(s) => Value::int(s.len() as i64),
                        Value::Array(arr) => Value::int(arr.len() as i64),
                        other => {
                            let type_name = other.type_name();
                            return Err(self.runtime_error(
                                Some(addr),
                                format!("sizeof applied to a {type_name} value"),
                            ));
                        }
                    };
                    self.stack.set_reg(decode_a(ins) as usize, res);
                }

                op::TYPEOF => {
                    let res = Value::static_string(
                        self.stack.reg(decode_b(ins) as usize).type_name(),
                    );
                    self.stack.set_reg(decode_a(ins) as usize, res);
                }

                op::CONCAT => {
                    let lhs = self.stack.reg(decode_b(ins) as usize);
                    let rhs = self.stack.reg(decode_c(ins) as usize);
                    let (Value::String(a), Value::String(b)) = (lhs, rhs) else {
                        return Err(self.runtime_error(
                            Some(addr),
                            "concatenation of non-string values".into(),
                        ));
                    };
                    let res = Value::String(Rc::new(a.concat(b)));
                    self.stack.set_reg(decode_a(ins) as usize, res);
                }

                op::LDCONST => {
                    let res = match decode_b(ins) {
                        const_kind::NIL => Value::Nil,
                        const_kind::TRUE => Value::bool(true),
                        const_kind::FALSE => Value::bool(false),
                        const_kind::INT => {
                            let Some(&word) = program.code().get(ip) else {
                                return Err(self.runtime_error(
                                    Some(addr),
                                    "unexpected end of bytecode".into(),
                                ));
                            };
                            ip += 1;
                            Value::int(word as i64)
                        }
                        const_kind::FLOAT => {
                            let Some(&word) = program.code().get(ip) else {
                                return Err(self.runtime_error(
                                    Some(addr),
                                    "unexpected end of bytecode".into(),
                                ));
                            };
                            ip += 1;
                            Value::float(f64::from_bits(word))
                        }
                        kind => {
                            return Err(self.runtime_error(
                                Some(addr),
                                format!("illegal constant kind {kind:#04x}"),
                            ));
                        }
                    };
                    self.stack.set_reg(decode_a(ins) as usize, res);
                }

                op::LDSYM => {
                    let symidx = decode_mid(ins) as usize;
                    let Some(slot) = program.symtab_slot(symidx) else {
                        return Err(self.runtime_error(
                            Some(addr),
                            format!("local symbol index {symidx} out of range"),
                        ));
                    };

                    let value = match slot {
                        // An unresolved global: resolve and memoize, so
                        // the global table is consulted exactly once per
                        // symbol.
                        SymtabSlot::Value(Value::SymStub(stub)) => {
                            let resolved = self.resolve_symbol(addr, stub.name())?;
                            program.symtab_store(symidx, resolved.clone());
                            resolved
                        }
                        SymtabSlot::Value(value) => value,
                        // Function definitions materialize bound to the
                        // owning program.
                        SymtabSlot::FuncDef { name, entry } => {
                            Value::function(Function::script(&name, entry, &program))
                        }
                    };
                    self.stack.set_reg(decode_a(ins) as usize, value);
                }

                op::MOV => {
                    // Retain before the destination releases; A and B may
                    // be the same register.
                    let value = self.stack.reg(decode_b(ins) as usize).clone();
                    self.stack.set_reg(decode_a(ins) as usize, value);
                }

                op::LDARGC => {
                    let argc = self.stack.header().real_argc;
                    self.stack
                        .set_reg(decode_a(ins) as usize, Value::int(argc as i64));
                }

                op::NEWARR => {
                    self.stack.set_reg(decode_a(ins) as usize, Value::array());
                }

                op::ARRGET => {
                    let container = self.stack.reg(decode_b(ins) as usize).clone();
                    let key = self.stack.reg(decode_c(ins) as usize).clone();
                    let res = match &container {
                        Value::Array(arr) => arr.get(&key),
                        Value::String(s) => {
                            let Value::Int(idx) = key else {
                                return Err(self.runtime_error(
                                    Some(addr),
                                    "indexing string with non-integer value".into(),
                                ));
                            };
                            let len = s.len() as i64;
                            // Negative indices count from the end.
                            let idx = if idx < 0 { len + idx } else { idx };
                            let Some(byte) = (idx >= 0).then(|| s.byte(idx as usize)).flatten()
                            else {
                                return Err(self.runtime_error(
                                    Some(addr),
                                    format!(
                                        "character at normalized index {idx} is \
                                         out of bounds for string of length {len}"
                                    ),
                                ));
                            };
                            Value::int(byte as i64)
                        }
                        _ => {
                            return Err(self.runtime_error(
                                Some(addr),
                                "first operand of [] operator must be an array or a string"
                                    .into(),
                            ));
                        }
                    };
                    self.stack.set_reg(decode_a(ins) as usize, res);
                }

                op::ARRSET => {
                    let container = self.stack.reg(decode_a(ins) as usize).clone();
                    let Value::Array(arr) = &container else {
                        return Err(self.runtime_error(
                            Some(addr),
                            "assignment to member of non-array value".into(),
                        ));
                    };
                    let key = self.stack.reg(decode_b(ins) as usize).clone();
                    // NaN != NaN, so it can't be used as an array key.
                    if matches!(key, Value::Float(x) if x.is_nan()) {
                        return Err(
                            self.runtime_error(Some(addr), "array index cannot be NaN".into())
                        );
                    }
                    let value = self.stack.reg(decode_c(ins) as usize).clone();
                    arr.set(&key, value);
                }

                op::NTHARG => {
                    // #N accesses the unnamed arguments only: regardless
                    // of the formal parameter count, #0 is the first
                    // argument past the declared ones.
                    let &Value::Int(argidx) = self.stack.reg(decode_b(ins) as usize) else {
                        return Err(self.runtime_error(
                            Some(addr),
                            "non-integer argument to `#` operator".into(),
                        ));
                    };
                    if argidx < 0 {
                        return Err(self.runtime_error(
                            Some(addr),
                            "negative argument to `#` operator".into(),
                        ));
                    }
                    if (argidx as usize) < self.stack.header().extra_argc {
                        let slot = self.stack.vararg_index(argidx as usize);
                        let value = self.stack.value_at(slot).clone();
                        self.stack.set_reg(decode_a(ins) as usize, value);
                    } else {
                        return Err(self.runtime_error(
                            Some(addr),
                            format!("argument `{argidx}` of `#` operator is out-of bounds"),
                        ));
                    }
                }

                op::FUNCTION => {
                    // Skip the embedded nested function: header plus body.
                    let Some(&bodylen) = program.code().get(ip + funchdr::IDX_BODYLEN) else {
                        return Err(
                            self.runtime_error(Some(addr), "unexpected end of bytecode".into())
                        );
                    };
                    ip += funchdr::LEN + bodylen as usize;
                }

                op::GLBVAL => {
                    let namelen = decode_mid(ins) as usize;
                    let nwords = words_for_name(namelen);
                    let Some(name) = program
                        .code()
                        .get(ip..)
                        .and_then(|tail| unpack_name(tail, namelen))
                    else {
                        return Err(
                            self.runtime_error(Some(addr), "malformed global name".into())
                        );
                    };
                    ip += nwords;

                    if !self.globals.get_str(&name).is_nil() {
                        return Err(self.runtime_error(
                            Some(addr),
                            format!("re-definition of global `{name}`"),
                        ));
                    }

                    let value = self.stack.reg(decode_a(ins) as usize).clone();
                    debug!(global = %name, "global registered");
                    self.globals.set_str(&name, value);
                }

                op::CLOSURE => {
                    let reg_index = decode_a(ins) as usize;
                    let n_upvals = decode_b(ins) as usize;

                    // The environment of the new closure is the currently
                    // executing function.
                    let enclosing = Rc::clone(&self.stack.header().callee);

                    let proto_val = self.stack.reg(reg_index).clone();
                    let Value::Function(proto) = &proto_val else {
                        return Err(self.runtime_error(
                            Some(addr),
                            "closure prototype must be a function".into(),
                        ));
                    };

                    let mut upvalues = Vec::with_capacity(n_upvals);
                    for _ in 0..n_upvals {
                        let Some(&desc) = program.code().get(ip) else {
                            return Err(self
                                .runtime_error(Some(addr), "unexpected end of bytecode".into()));
                        };
                        ip += 1;

                        let index = decode_a(desc) as usize;
                        match decode_opcode(desc) {
                            // Upvalue is a local of the enclosing frame.
                            upval::LOCAL => upvalues.push(self.stack.reg(index).clone()),
                            // Upvalue lives in the enclosing closure.
                            upval::OUTER => {
                                let Some(cells) = enclosing.upvalues() else {
                                    return Err(self.runtime_error(
                                        Some(addr),
                                        "enclosing function has no upvalues".into(),
                                    ));
                                };
                                let Some(value) = cells.borrow().get(index).cloned() else {
                                    return Err(self.runtime_error(
                                        Some(addr),
                                        format!("upvalue index {index} out of range"),
                                    ));
                                };
                                upvalues.push(value);
                            }
                            kind => {
                                return Err(self.runtime_error(
                                    Some(addr),
                                    format!("illegal upvalue capture kind {kind:#04x}"),
                                ));
                            }
                        }
                    }

                    // Replace the prototype in the register with the new
                    // closure.
                    let closure = Value::function(Function::closure(proto, upvalues));
                    self.stack.set_reg(reg_index, closure);
                }

                op::LDUPVAL => {
                    let upval_index = decode_b(ins) as usize;
                    let current = Rc::clone(&self.stack.header().callee);
                    let Some(cells) = current.upvalues() else {
                        return Err(
                            self.runtime_error(Some(addr), "function has no upvalues".into())
                        );
                    };
                    let Some(value) = cells.borrow().get(upval_index).cloned() else {
                        return Err(self.runtime_error(
                            Some(addr),
                            format!("upvalue index {upval_index} out of range"),
                        ));
                    };
                    self.stack.set_reg(decode_a(ins) as usize, value);
                }

                _ => {
                    return Err(self.runtime_error(
                        Some(addr),
                        format!("illegal instruction {opcode:#04x}"),
                    ));
                }
            }
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// Arithmetic on two number registers. A float on either side promotes
/// the operation to doubles; integer arithmetic wraps (two's complement).
fn arith_op(lhs: &Value, rhs: &Value, opcode: u8) -> Result<Value, &'static str> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => {
            let res = match opcode {
                op::ADD => a.wrapping_add(*b),
                op::SUB => a.wrapping_sub(*b),
                op::MUL => a.wrapping_mul(*b),
                _ => {
                    if *b == 0 {
                        return Err("division by zero");
                    }
                    a.wrapping_div(*b)
                }
            };
            Ok(Value::int(res))
        }
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let a = promote(lhs);
            let b = promote(rhs);
            let res = match opcode {
                op::ADD => a + b,
                op::SUB => a - b,
                op::MUL => a * b,
                _ => a / b,
            };
            Ok(Value::float(res))
        }
        _ => Err("arithmetic on non-numbers"),
    }
}

/// Widen a number value to a double.
fn promote(value: &Value) -> f64 {
    match value {
        Value::Int(n) => *n as f64,
        Value::Float(x) => *x,
        _ => unreachable!("promotion of a non-number"),
    }
}

/// Bitwise operation on two integers. Shift counts are masked to the
/// 0..64 range; right shift is arithmetic.
const fn bitwise_op(a: i64, b: i64, opcode: u8) -> i64 {
    match opcode {
        op::AND => a & b,
        op::OR => a | b,
        op::XOR => a ^ b,
        op::SHL => a.wrapping_shl(b as u32),
        _ => a.wrapping_shr(b as u32),
    }
}
