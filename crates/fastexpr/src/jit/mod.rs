//! Native tier: lowers bytecode units to machine code via Cranelift.
//!
//! Only bare units whose parameters, locals and return value are all `i64`
//! or `bool` are lowered, and only when every instruction has a
//! non-throwing native form. Anything else stays on the VM.
//!
//! # Calling Convention
//!
//! A native unit takes a single pointer to its argument slots:
//!
//! ```text
//! fn(args: *const i64) -> i64
//! ```
//!
//! Each argument occupies one slot; booleans are `0` or `1`.

#[cfg(test)]
mod tests;

mod compiler;

pub use compiler::{compile_unit, NativeCode};
