//! Condition expressions
//!
//! Campaign condition trees are binary ASTs over streaming signals. They
//! are built (and type-checked) at campaign activation and read-only
//! thereafter. Evaluation uses three-valued logic: a reference to a signal
//! that has not been seen yet is `Undefined`, and every operator with an
//! `Undefined` operand yields `Undefined` — unless a custom function is
//! documented to tolerate it.

mod eval;
mod tree;
mod value;

pub use eval::{evaluate, CustomFnDispatch, EvalContext, SignalReader};
pub use tree::{
    collect_signal_refs, typecheck, CompareOp, ConditionNode, LogicalOp, TypecheckError,
    WindowFunction, MAX_TREE_DEPTH,
};
pub use value::InspectionValue;
