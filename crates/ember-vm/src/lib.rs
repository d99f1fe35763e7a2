// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! # Ember VM
//!
//! Register-based bytecode virtual machine for Ember, a dynamically typed
//! scripting language.
//!
//! This crate provides:
//! - Tagged, reference-counted value representation
//! - A frame-structured, growable value stack
//! - The instruction dispatcher (~35 opcodes)
//! - Lazy local symbol tables with global symbol resolution and memoization
//! - Closures with upvalue capture
//! - A host embedding surface: native function libraries, context passing,
//!   last-error retrieval and stack traces
//!
//! The compiler that produces bytecode images is a separate concern; the VM
//! consumes compiled images through [`value::Function::top_program`].

mod stack;

pub mod bytecode;
pub mod value;
pub mod vm;

// Re-export commonly used types at crate root
pub use value::{Array, Function, Program, Str, SymtabSlot, UserInfo, Value};
pub use vm::{ExecError, NativeError, NativeFn, Vm};

/// Crate version.
pub const VERSION: &str = match option_env!("EMBER_VERSION") {
    Some(v) => v,
    None => "unknown",
};
