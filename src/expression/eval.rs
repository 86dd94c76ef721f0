//! Condition tree evaluator
//!
//! Evaluation is strict and left-to-right: both operands are computed
//! before the operator applies, so custom functions see every pass even
//! when a short-circuit would have skipped them. No failure propagates out
//! of an evaluation; everything folds to `Undefined` and the engine moves
//! on.

use super::tree::{CompareOp, ConditionNode, LogicalOp, WindowFunction};
use super::value::InspectionValue;
use crate::types::SignalId;

/// Read access to the engine's per-signal state during evaluation.
pub trait SignalReader {
    /// Latest sample value, `Undefined` until the signal is first seen.
    fn latest(&self, signal_id: SignalId) -> InspectionValue;

    /// Fixed-window aggregate, `Undefined` until a full window has rolled.
    fn window(&self, func: WindowFunction, signal_id: SignalId) -> InspectionValue;
}

/// Dispatch point for custom functions referenced from condition trees.
///
/// Implementations must swallow their own errors and return `Undefined`;
/// a custom function never aborts the evaluation pass.
pub trait CustomFnDispatch {
    fn invoke(
        &mut self,
        name: &str,
        campaign_sync_id: &str,
        args: &[InspectionValue],
    ) -> InspectionValue;
}

/// Everything one evaluation pass needs.
pub struct EvalContext<'a> {
    pub campaign_sync_id: &'a str,
    pub signals: &'a dyn SignalReader,
    pub functions: &'a mut dyn CustomFnDispatch,
}

/// Evaluate a condition tree to its three-valued result.
pub fn evaluate(tree: &ConditionNode, ctx: &mut EvalContext<'_>) -> InspectionValue {
    match tree {
        ConditionNode::BoolLiteral { value } => InspectionValue::Bool(*value),
        ConditionNode::NumberLiteral { value } => InspectionValue::Number(*value),
        ConditionNode::StringLiteral { value } => InspectionValue::String(value.clone()),
        ConditionNode::SignalRef { signal_id } => ctx.signals.latest(*signal_id),
        ConditionNode::WindowFn { func, signal_id } => ctx.signals.window(*func, *signal_id),
        ConditionNode::Comparison { op, left, right } => {
            let lhs = evaluate(left, ctx);
            let rhs = evaluate(right, ctx);
            match op {
                CompareOp::Eq => lhs.eq_value(&rhs),
                CompareOp::Ne => lhs.eq_value(&rhs).not(),
                CompareOp::Lt => lhs.compare_numeric(&rhs, |a, b| a < b),
                CompareOp::Le => lhs.compare_numeric(&rhs, |a, b| a <= b),
                CompareOp::Gt => lhs.compare_numeric(&rhs, |a, b| a > b),
                CompareOp::Ge => lhs.compare_numeric(&rhs, |a, b| a >= b),
            }
        }
        ConditionNode::Logical { op, left, right } => {
            let lhs = evaluate(left, ctx);
            match op {
                LogicalOp::Not => lhs.not(),
                LogicalOp::And => match right {
                    Some(right) => {
                        let rhs = evaluate(right, ctx);
                        lhs.and(&rhs)
                    }
                    None => InspectionValue::Undefined,
                },
                LogicalOp::Or => match right {
                    Some(right) => {
                        let rhs = evaluate(right, ctx);
                        lhs.or(&rhs)
                    }
                    None => InspectionValue::Undefined,
                },
            }
        }
        ConditionNode::CustomFn { name, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(evaluate(arg, ctx));
            }
            ctx.functions.invoke(name, ctx.campaign_sync_id, &values)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeSignals {
        values: HashMap<SignalId, InspectionValue>,
    }

    impl SignalReader for FakeSignals {
        fn latest(&self, signal_id: SignalId) -> InspectionValue {
            self.values
                .get(&signal_id)
                .cloned()
                .unwrap_or(InspectionValue::Undefined)
        }

        fn window(&self, _func: WindowFunction, _signal_id: SignalId) -> InspectionValue {
            InspectionValue::Undefined
        }
    }

    struct RecordingFns {
        calls: Vec<(String, Vec<InspectionValue>)>,
        result: InspectionValue,
    }

    impl CustomFnDispatch for RecordingFns {
        fn invoke(
            &mut self,
            name: &str,
            _campaign_sync_id: &str,
            args: &[InspectionValue],
        ) -> InspectionValue {
            self.calls.push((name.to_string(), args.to_vec()));
            self.result.clone()
        }
    }

    fn ctx<'a>(
        signals: &'a FakeSignals,
        functions: &'a mut RecordingFns,
    ) -> EvalContext<'a> {
        EvalContext {
            campaign_sync_id: "C1",
            signals,
            functions,
        }
    }

    fn speed_gt(threshold: f64) -> ConditionNode {
        ConditionNode::Comparison {
            op: CompareOp::Gt,
            left: Box::new(ConditionNode::SignalRef { signal_id: 1 }),
            right: Box::new(ConditionNode::NumberLiteral { value: threshold }),
        }
    }

    #[test]
    fn test_comparison_on_seen_signal() {
        let signals = FakeSignals {
            values: [(1, InspectionValue::Number(120.0))].into_iter().collect(),
        };
        let mut fns = RecordingFns { calls: vec![], result: InspectionValue::Undefined };

        let result = evaluate(&speed_gt(100.0), &mut ctx(&signals, &mut fns));
        assert_eq!(result, InspectionValue::Bool(true));
    }

    #[test]
    fn test_unseen_signal_is_undefined() {
        let signals = FakeSignals { values: HashMap::new() };
        let mut fns = RecordingFns { calls: vec![], result: InspectionValue::Undefined };

        let result = evaluate(&speed_gt(100.0), &mut ctx(&signals, &mut fns));
        assert_eq!(result, InspectionValue::Undefined);
    }

    #[test]
    fn test_undefined_absorbs_through_and() {
        let signals = FakeSignals { values: HashMap::new() };
        let mut fns = RecordingFns { calls: vec![], result: InspectionValue::Undefined };

        let tree = ConditionNode::Logical {
            op: LogicalOp::And,
            left: Box::new(ConditionNode::BoolLiteral { value: false }),
            right: Some(Box::new(speed_gt(1.0))),
        };
        // Strict evaluation: false AND undefined is undefined, not false.
        assert_eq!(evaluate(&tree, &mut ctx(&signals, &mut fns)), InspectionValue::Undefined);
    }

    #[test]
    fn test_custom_fn_receives_evaluated_args() {
        let signals = FakeSignals {
            values: [(2, InspectionValue::Bool(true))].into_iter().collect(),
        };
        let mut fns = RecordingFns { calls: vec![], result: InspectionValue::Bool(true) };

        let tree = ConditionNode::CustomFn {
            name: "multi_rising_edge".to_string(),
            args: vec![
                ConditionNode::StringLiteral { value: "abc".to_string() },
                ConditionNode::SignalRef { signal_id: 2 },
            ],
        };
        let result = evaluate(&tree, &mut ctx(&signals, &mut fns));

        assert_eq!(result, InspectionValue::Bool(true));
        assert_eq!(fns.calls.len(), 1);
        assert_eq!(
            fns.calls[0].1,
            vec![
                InspectionValue::String("abc".to_string()),
                InspectionValue::Bool(true)
            ]
        );
    }
}
