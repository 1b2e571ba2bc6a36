//! # qif-rs: bit-precise quantitative information flow analysis
//!
//! **`qif-rs`** computes how many bits of secret input a program can leak to an attacker
//! observing its public outputs.
//!
//! ## How it works
//!
//! Every program value is a vector of abstract [`Bit`][crate::bit::Bit]s. A bit is either a
//! constant, unknown (`u`) or don't-care (`x`), and records the bits it was computed from
//! (data dependencies) and the unknown branch conditions it was computed under (control
//! dependencies). Evaluating the program yields a dependency graph between the input bits
//! and the output bits.
//!
//! For an attacker at security level `L`, the leakage is the size of a minimum vertex cut
//! separating the outputs visible at `L` from the inputs not visible at `L`: every bit of
//! information that flows from the secrets to the outputs passes through the cut, so the
//! cut size bounds the number of leaked bits.
//!
//! ## Key Features
//!
//! - **Bit-level operators**: gates, ripple-carry arithmetic and comparisons that keep
//!   constants constant and only depend on the operands that matter (`u & 0 = 0`).
//! - **Interprocedural analysis**: calls are handled by pluggable
//!   [`MethodInvocationHandler`][crate::handler::MethodInvocationHandler]s: conservative
//!   approximation, bounded inlining, or per-method summaries computed by a fixpoint over
//!   the call graph and compressed with minimum cuts.
//! - **Security lattices**: the two-point `l ⊑ h` lattice and the diamond lattice.
//!
//! ## Basic Usage
//!
//! ```rust
//! use qif_rs::analysis::{analyze, Options};
//! use qif_rs::ast::{BinaryOp, ProgramBuilder};
//! use qif_rs::lattice::Sec;
//!
//! // h = input(h, 0buuuu); o = h & 1; output(l, o)
//! let mut b = ProgramBuilder::new();
//! let h = b.declare("h");
//! let o = b.declare("o");
//! let input = b.input(h, Sec::H, "0buuuu").unwrap();
//! let read = b.var(h);
//! let one = b.int(1);
//! let masked = b.binary(BinaryOp::And, read, one);
//! let output = b.output(o, Sec::L, masked);
//! let program = b.finish(vec![input, output]);
//!
//! let result = analyze(&program, &Options::default()).unwrap();
//! assert_eq!(result.leakage(Sec::L).unwrap().bits, 1);
//! ```
//!
//! ## Core Components
//!
//! - **[`interpreter`]** and **[`operator`]**: evaluation of programs into bit graphs.
//! - **[`handler`]**: method invocation strategies and their configuration language.
//! - **[`leakage`]** and **[`mincut`]**: leakage quantification.
//! - **[`analysis`]**: the entry point tying everything together.

pub mod analysis;
pub mod ast;
pub mod bit;
pub mod bitset;
pub mod call_graph;
pub mod context;
pub mod dot;
pub mod error;
pub mod handler;
pub mod interpreter;
pub mod lattice;
pub mod leakage;
pub mod mincut;
pub mod operator;
pub mod value;
pub mod write_once;
