//! Condition tree AST and type checking

use crate::decoder::DecoderManifest;
use crate::types::{SignalId, SignalType};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Maximum node depth accepted at campaign activation. Deeper trees are
/// rejected and never evaluated.
pub const MAX_TREE_DEPTH: usize = 32;

/// Comparison operators over numeric (and, for eq/ne, bool/string) operands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Boolean connectives.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOp {
    And,
    Or,
    Not,
}

/// Built-in window aggregate functions over a signal's fixed window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WindowFunction {
    LastWindowMin,
    LastWindowMax,
    LastWindowAvg,
    PrevLastWindowMin,
    PrevLastWindowMax,
    PrevLastWindowAvg,
}

/// Binary AST of a campaign condition.
///
/// Built at campaign activation, read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum ConditionNode {
    BoolLiteral {
        value: bool,
    },
    NumberLiteral {
        value: f64,
    },
    StringLiteral {
        value: String,
    },
    SignalRef {
        signal_id: SignalId,
    },
    WindowFn {
        func: WindowFunction,
        signal_id: SignalId,
    },
    Comparison {
        op: CompareOp,
        left: Box<ConditionNode>,
        right: Box<ConditionNode>,
    },
    Logical {
        op: LogicalOp,
        left: Box<ConditionNode>,
        /// Absent for `Not`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        right: Option<Box<ConditionNode>>,
    },
    CustomFn {
        name: String,
        #[serde(default)]
        args: Vec<ConditionNode>,
    },
}

/// Static type of a subtree, used only during activation-time checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StaticType {
    Bool,
    Number,
    String,
}

/// Reasons a campaign's condition is rejected at activation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypecheckError {
    #[error("condition tree exceeds max depth of {MAX_TREE_DEPTH}")]
    DepthExceeded,

    #[error("signal {0} not present in decoder manifest")]
    UnknownSignal(SignalId),

    #[error("signal {signal_id} has type {actual}, expected a numeric type")]
    NonNumericSignal { signal_id: SignalId, actual: SignalType },

    #[error("comparison operands have incompatible types")]
    IncomparableOperands,

    #[error("logical operator applied to a non-boolean subtree")]
    NonBooleanOperand,

    #[error("logical operator arity is wrong")]
    BadArity,

    #[error("condition root is not boolean")]
    NonBooleanRoot,
}

/// Check a condition tree against the active manifest.
///
/// Verifies that every referenced signal exists, that operand types
/// resolve, and that the root produces a boolean. Custom function calls
/// typecheck their signal arguments but are otherwise opaque (their result
/// is boolean by contract).
pub fn typecheck(tree: &ConditionNode, manifest: &DecoderManifest) -> Result<(), TypecheckError> {
    let root_type = check_node(tree, manifest, 0)?;
    if root_type != StaticType::Bool {
        return Err(TypecheckError::NonBooleanRoot);
    }
    Ok(())
}

fn check_node(
    node: &ConditionNode,
    manifest: &DecoderManifest,
    depth: usize,
) -> Result<StaticType, TypecheckError> {
    if depth >= MAX_TREE_DEPTH {
        return Err(TypecheckError::DepthExceeded);
    }

    match node {
        ConditionNode::BoolLiteral { .. } => Ok(StaticType::Bool),
        ConditionNode::NumberLiteral { .. } => Ok(StaticType::Number),
        ConditionNode::StringLiteral { .. } => Ok(StaticType::String),
        ConditionNode::SignalRef { signal_id } => {
            let ty = manifest
                .signal_type(*signal_id)
                .ok_or(TypecheckError::UnknownSignal(*signal_id))?;
            if ty == SignalType::Bool {
                Ok(StaticType::Bool)
            } else if ty.is_numeric() {
                Ok(StaticType::Number)
            } else {
                Ok(StaticType::String)
            }
        }
        ConditionNode::WindowFn { signal_id, .. } => {
            let ty = manifest
                .signal_type(*signal_id)
                .ok_or(TypecheckError::UnknownSignal(*signal_id))?;
            if !ty.is_numeric() {
                return Err(TypecheckError::NonNumericSignal {
                    signal_id: *signal_id,
                    actual: ty,
                });
            }
            Ok(StaticType::Number)
        }
        ConditionNode::Comparison { op, left, right } => {
            let lt = check_node(left, manifest, depth + 1)?;
            let rt = check_node(right, manifest, depth + 1)?;
            let comparable = match (lt, rt) {
                (StaticType::Number, StaticType::Number) => true,
                (StaticType::Bool, StaticType::Bool)
                | (StaticType::String, StaticType::String) => {
                    matches!(op, CompareOp::Eq | CompareOp::Ne)
                }
                _ => false,
            };
            if !comparable {
                return Err(TypecheckError::IncomparableOperands);
            }
            Ok(StaticType::Bool)
        }
        ConditionNode::Logical { op, left, right } => {
            match (op, right) {
                (LogicalOp::Not, None) => {}
                (LogicalOp::Not, Some(_)) | (LogicalOp::And, None) | (LogicalOp::Or, None) => {
                    return Err(TypecheckError::BadArity);
                }
                _ => {}
            }
            if check_node(left, manifest, depth + 1)? != StaticType::Bool {
                return Err(TypecheckError::NonBooleanOperand);
            }
            if let Some(right) = right {
                if check_node(right, manifest, depth + 1)? != StaticType::Bool {
                    return Err(TypecheckError::NonBooleanOperand);
                }
            }
            Ok(StaticType::Bool)
        }
        ConditionNode::CustomFn { args, .. } => {
            for arg in args {
                check_node(arg, manifest, depth + 1)?;
            }
            Ok(StaticType::Bool)
        }
    }
}

/// Every signal the tree reads, for dependency tracking and the
/// required-signals union.
pub fn collect_signal_refs(tree: &ConditionNode, out: &mut HashSet<SignalId>) {
    match tree {
        ConditionNode::SignalRef { signal_id } | ConditionNode::WindowFn { signal_id, .. } => {
            out.insert(*signal_id);
        }
        ConditionNode::Comparison { left, right, .. } => {
            collect_signal_refs(left, out);
            collect_signal_refs(right, out);
        }
        ConditionNode::Logical { left, right, .. } => {
            collect_signal_refs(left, out);
            if let Some(right) = right {
                collect_signal_refs(right, out);
            }
        }
        ConditionNode::CustomFn { args, .. } => {
            for arg in args {
                collect_signal_refs(arg, out);
            }
        }
        ConditionNode::BoolLiteral { .. }
        | ConditionNode::NumberLiteral { .. }
        | ConditionNode::StringLiteral { .. } => {}
    }
}
