//! The intermediate representations that lifted machine code arrives in.
//!
//! Two dialects are supported: [`vex`], a typed-temporary IR close to the
//! lifter's output, and [`ail`], a higher-level statement form produced by
//! later pipeline stages. Analyses consume both through [`Block`] and the
//! [`Function`] flow graph.

pub mod ail;
pub mod vex;

mod block;

pub use block::{Block, BlockId, BlockIr, FlowGraph, Function};
