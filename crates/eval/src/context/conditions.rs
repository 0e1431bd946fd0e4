//! Condition expressions and utility scores.
//!
//! Conditions and considerations are stored flat with an operand and a
//! delta indent; the indent opens and closes parentheses. Both evaluate on a
//! small value stack, one level per open parenthesis.

use statetree_core::node::{ConditionEvaluationMode, ExpressionOperand};
use statetree_core::{NodeRange, RunStatus, MAX_EXPRESSION_INDENT};

use super::data::CopyMode;
use super::{nodes, ExecutionContext, FrameSet};
use crate::trace::NodeCall;

/// One slot per indent level, plus the current value on top.
const STACK_SIZE: usize = MAX_EXPRESSION_INDENT + 2;

/// Parentheses opened before and closed after the value at `delta_indent`.
fn parens(delta_indent: i8) -> (usize, usize) {
    let delta = i32::from(delta_indent);
    (delta.max(0) as usize + 1, (-delta).max(0) as usize + 1)
}

impl<'a> ExecutionContext<'a> {
    /// Evaluates the condition expression in `conditions`. An empty range
    /// passes. A condition whose bindings cannot be copied fails the whole
    /// expression.
    pub(crate) fn test_all_conditions(
        &mut self,
        set: FrameSet,
        frame_index: usize,
        conditions: NodeRange,
    ) -> bool {
        if conditions.is_empty() {
            return true;
        }
        let Some(tree) = self.frame_tree(set, frame_index) else {
            return false;
        };
        let Some(tree_id) = self.frames(set).get(frame_index).map(|f| f.tree) else {
            return false;
        };

        let mut operands = [ExpressionOperand::Copy; STACK_SIZE];
        let mut values = [false; STACK_SIZE];
        let mut level = 0usize;

        for (position, node_index) in conditions.range().enumerate() {
            let Some(node) = tree.node(node_index) else {
                values[0] = false;
                break;
            };
            let Some(condition) = node.kind.as_condition() else {
                continue;
            };

            let value = match condition.evaluation_mode {
                ConditionEvaluationMode::ForcedTrue => true,
                ConditionEvaluationMode::ForcedFalse => false,
                ConditionEvaluationMode::Evaluated => {
                    let Some(target) = self.resolve(set, frame_index, node.instance) else {
                        values[0] = false;
                        break;
                    };
                    if !self.copy_batch(set, frame_index, &target, node.bindings, CopyMode::Validated) {
                        tracing::debug!(tree = %tree.name, condition = %node.name, "condition bindings failed");
                        values[0] = false;
                        break;
                    }
                    let passed = self
                        .instance(&target)
                        .is_some_and(|data| nodes::test_condition(&condition.kind, data));
                    self.reset_bound_objects(&target, node.bindings, tree);
                    passed != condition.invert
                }
            };
            let status = if value { RunStatus::Succeeded } else { RunStatus::Failed };
            self.record_node(tree_id, &node.name, NodeCall::TestCondition, Some(status));

            let (open, close) = parens(condition.delta_indent);
            operands[level] = if position == 0 {
                ExpressionOperand::Copy
            } else {
                condition.operand
            };
            level += open;
            if level >= STACK_SIZE {
                values[0] = false;
                break;
            }
            values[level] = value;

            for _ in 0..close {
                if level == 0 {
                    break;
                }
                level -= 1;
                values[level] = match operands[level] {
                    ExpressionOperand::Copy => values[level + 1],
                    ExpressionOperand::And => values[level] && values[level + 1],
                    ExpressionOperand::Or => values[level] || values[level + 1],
                };
                operands[level] = ExpressionOperand::Copy;
            }
        }

        values[0]
    }

    /// Scores a state from its considerations, scaled by `weight`. `And`
    /// takes the minimum and `Or` the maximum. An empty range scores zero.
    pub(crate) fn evaluate_utility(
        &mut self,
        set: FrameSet,
        frame_index: usize,
        considerations: NodeRange,
        weight: f32,
    ) -> f32 {
        if considerations.is_empty() {
            return 0.0;
        }
        let Some(tree) = self.frame_tree(set, frame_index) else {
            return 0.0;
        };

        let mut operands = [ExpressionOperand::Copy; STACK_SIZE];
        let mut values = [0.0f32; STACK_SIZE];
        let mut level = 0usize;

        for (position, node_index) in considerations.range().enumerate() {
            let Some(node) = tree.node(node_index) else {
                values[0] = 0.0;
                break;
            };
            let Some(consideration) = node.kind.as_consideration() else {
                continue;
            };
            let Some(target) = self.resolve(set, frame_index, node.instance) else {
                values[0] = 0.0;
                break;
            };
            if !self.copy_batch(set, frame_index, &target, node.bindings, CopyMode::Validated) {
                values[0] = 0.0;
                break;
            }
            let score = self
                .instance(&target)
                .map_or(0.0, |data| nodes::score(&consideration.kind, data));

            let (open, close) = parens(consideration.delta_indent);
            operands[level] = if position == 0 {
                ExpressionOperand::Copy
            } else {
                consideration.operand
            };
            level += open;
            if level >= STACK_SIZE {
                values[0] = 0.0;
                break;
            }
            values[level] = score;

            for _ in 0..close {
                if level == 0 {
                    break;
                }
                level -= 1;
                values[level] = match operands[level] {
                    ExpressionOperand::Copy => values[level + 1],
                    ExpressionOperand::And => values[level].min(values[level + 1]),
                    ExpressionOperand::Or => values[level].max(values[level + 1]),
                };
                operands[level] = ExpressionOperand::Copy;
            }
        }

        values[0] * weight
    }
}

#[cfg(test)]
mod tests {
    use statetree_core::node::{ConditionEvaluationMode, ExpressionOperand};
    use statetree_core::{
        AssetId, ConditionDefinition, ConsiderationDefinition, LibraryDefinition,
        StateDefinition, TreeDefinition, TreeLibrary,
    };

    use crate::context::{ExecutionContext, FrameSet};
    use crate::storage::InstanceStorage;

    fn library(root: StateDefinition) -> TreeLibrary {
        TreeLibrary::compile(&LibraryDefinition::single(TreeDefinition::new("T", root))).unwrap()
    }

    /// Evaluates `conditions` as the enter conditions of a child that is
    /// never selected, so the tree starts regardless of the result.
    fn conditions_pass(conditions: Vec<ConditionDefinition>) -> bool {
        let mut guarded = StateDefinition::new("Guarded");
        for condition in conditions {
            guarded = guarded.enter_condition(condition);
        }
        let lib = library(
            StateDefinition::new("Root")
                .child(StateDefinition::new("Idle"))
                .child(guarded),
        );
        let tree = &lib[AssetId(0)];
        let range = tree.state(tree.find_state("Guarded").unwrap()).unwrap().enter_conditions;
        let mut storage = InstanceStorage::new();
        let mut ctx = ExecutionContext::new(&lib, AssetId(0), &mut storage);
        ctx.start(None, None);
        ctx.test_all_conditions(FrameSet::Active, 0, range)
    }

    #[test]
    fn empty_expression_passes() {
        assert!(conditions_pass(Vec::new()));
    }

    #[test]
    fn and_binds_flat_expressions() {
        assert!(!conditions_pass(vec![
            ConditionDefinition::always(true),
            ConditionDefinition::always(false).operand(ExpressionOperand::And),
        ]));
        assert!(conditions_pass(vec![
            ConditionDefinition::always(false),
            ConditionDefinition::always(true).operand(ExpressionOperand::Or),
        ]));
    }

    #[test]
    fn indent_groups_with_the_item_above() {
        // true OR (false AND false)
        assert!(conditions_pass(vec![
            ConditionDefinition::always(true),
            ConditionDefinition::always(false).operand(ExpressionOperand::Or),
            ConditionDefinition::always(false)
                .operand(ExpressionOperand::And)
                .indent(1),
        ]));
        // false AND (false OR true)
        assert!(!conditions_pass(vec![
            ConditionDefinition::always(false),
            ConditionDefinition::always(false).operand(ExpressionOperand::And),
            ConditionDefinition::always(true)
                .operand(ExpressionOperand::Or)
                .indent(1),
        ]));
    }

    #[test]
    fn forced_modes_and_inversion() {
        assert!(conditions_pass(vec![ConditionDefinition::always(false)
            .mode(ConditionEvaluationMode::ForcedTrue)]));
        assert!(conditions_pass(vec![ConditionDefinition::always(false).inverted()]));
        assert!(!conditions_pass(vec![ConditionDefinition::always(true)
            .inverted()
            .mode(ConditionEvaluationMode::Evaluated)]));
    }

    #[test]
    fn utility_uses_min_for_and_and_max_for_or() {
        let root = StateDefinition::new("Root")
            .consideration(ConsiderationDefinition::constant(0.8))
            .consideration(ConsiderationDefinition::constant(0.3).operand(ExpressionOperand::And))
            .weight(2.0);
        let lib = library(root);
        let state = &lib[AssetId(0)].states[0];
        let (range, weight) = (state.considerations, state.weight);
        let mut storage = InstanceStorage::new();
        let mut ctx = ExecutionContext::new(&lib, AssetId(0), &mut storage);
        ctx.start(None, None);
        let score = ctx.evaluate_utility(FrameSet::Active, 0, range, weight);
        assert!((score - 0.6).abs() < 1e-5);

        let root = StateDefinition::new("Root")
            .consideration(ConsiderationDefinition::constant(0.2))
            .consideration(ConsiderationDefinition::constant(0.7).operand(ExpressionOperand::Or));
        let lib = library(root);
        let state = &lib[AssetId(0)].states[0];
        let (range, weight) = (state.considerations, state.weight);
        let mut storage = InstanceStorage::new();
        let mut ctx = ExecutionContext::new(&lib, AssetId(0), &mut storage);
        ctx.start(None, None);
        let score = ctx.evaluate_utility(FrameSet::Active, 0, range, weight);
        assert!((score - 0.7).abs() < 1e-5);
    }
}
