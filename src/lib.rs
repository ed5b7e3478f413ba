//! quicktrace: a trace-based JIT core for a YARV-style bytecode interpreter
//!
//! The interpreter counts visits to loop headers. Once a header is hot the
//! recorder follows the interpreter through one iteration, translating every
//! executed instruction into typed, guarded IR; the optimizer folds and
//! cleans the IR; a backend compiles it. Guards that fail at run time leave
//! the trace through side-exit stack maps that rebuild the interpreter's
//! operand stack exactly, and hot side exits grow child traces.
//!
//! # Quick Start
//!
//! ```no_run
//! use quicktrace::{Interpreter, JitConfig, Value};
//!
//! fn main() -> quicktrace::Result<()> {
//!     let mut interp = Interpreter::with_jit(JitConfig::default())?;
//!     let result = interp.eval(quicktrace::demos::find("counter")?.source)?;
//!     assert_eq!(result, Value::Fixnum(100000));
//!     println!("{}", interp.jit_stats().unwrap_or_default());
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! Bytecode flows: [`bytecode`] → [`runtime`] (interpretation) → [`jit`]
//! (recording, optimization) → [`backend`] (compiled traces) → back into
//! [`runtime`] at trace exits.
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Host** | [`bytecode`], [`runtime`] |
//! | **JIT** | [`jit`], [`backend`] |
//! | **Support** | [`config`], [`demos`], [`error`](Error) |
// Clippy configuration for quicktrace.
//
// These suppressions exist because:
// - too_many_arguments: recorder helpers pass the guard context explicitly
// - new_without_default: engine parts take their sizes from configuration
// - should_implement_trait: Value has custom eq/cmp semantics
#![allow(clippy::too_many_arguments)]
#![allow(clippy::new_without_default)]
#![allow(clippy::should_implement_trait)]

pub mod backend;
pub mod bytecode;
pub mod config;
pub mod demos;
pub mod jit;
pub mod runtime;

mod error;

pub use backend::ReferenceBackend;
pub use config::JitConfig;
pub use error::{CodeLocation, Error, Result, RuntimeErrorKind};
pub use jit::stats::JitStats;
pub use jit::JitEngine;
pub use runtime::{Interpreter, Machine, Value};

/// quicktrace version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
