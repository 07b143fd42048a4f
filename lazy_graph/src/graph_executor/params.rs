use crate::function::Params;
use crate::graph::Node;
use crate::value::{Value, ValueUsage};

use super::{CurrentTask, RunState};

/// What a function body running inside a graph sees.
///
/// Inputs that were ready when the node started are moved in here, so the body can read them
/// without holding the node lock. Unconsumed inputs are handed back when the body returns.
pub(crate) struct GraphParams<'t, 'a, 'p> {
    node: &'t Node,
    task: &'t mut CurrentTask,
    run_state: &'t RunState<'a, 'p>,
    inputs: Vec<Option<Value>>,
    outputs: Vec<Option<Value>>,
    output_usages: Vec<ValueUsage>,
    outputs_set: Vec<bool>,
}

impl<'t, 'a, 'p> GraphParams<'t, 'a, 'p> {
    pub fn new(
        node: &'t Node,
        task: &'t mut CurrentTask,
        run_state: &'t RunState<'a, 'p>,
        inputs: Vec<Option<Value>>,
        output_usages: Vec<ValueUsage>,
        outputs_set: Vec<bool>,
    ) -> Self {
        debug_assert_eq!(inputs.len(), node.inputs.len());
        debug_assert_eq!(output_usages.len(), node.outputs.len());

        GraphParams {
            node,
            task,
            run_state,
            inputs,
            outputs: node.outputs.iter().map(|_| None).collect(),
            output_usages,
            outputs_set,
        }
    }

    pub fn into_inputs(self) -> Vec<Option<Value>> {
        self.inputs
    }
}

impl Params for GraphParams<'_, '_, '_> {
    fn try_get_input(&mut self, index: usize) -> Option<&Value> {
        self.inputs[index].as_ref()
    }

    fn try_get_input_or_request(&mut self, index: usize) -> Option<&Value> {
        if self.inputs[index].is_none() {
            let executor = self.run_state.executor;
            // the value may have arrived after the node started
            self.inputs[index] =
                executor.with_locked_node(self.node, self.task, self.run_state, |locked| {
                    if executor.set_input_required(locked, index) {
                        locked.state.inputs[index].value.take()
                    } else {
                        None
                    }
                });
        }

        self.inputs[index].as_ref()
    }

    fn try_extract_input(&mut self, index: usize) -> Option<Value> {
        self.inputs[index].take()
    }

    fn output_slot(&mut self, index: usize) -> &mut Option<Value> {
        debug_assert!(!self.outputs_set[index]);
        &mut self.outputs[index]
    }

    fn output_set(&mut self, index: usize) {
        debug_assert!(!self.outputs_set[index], "Output {index} set twice");
        let value = self.outputs[index]
            .take()
            .expect("Output slot must be filled before it is marked as set");
        self.outputs_set[index] = true;

        let executor = self.run_state.executor;
        executor.with_locked_node(self.node, self.task, self.run_state, |locked| {
            let output_state = &mut locked.state.outputs[index];
            debug_assert!(!output_state.has_been_computed);
            output_state.has_been_computed = true;
        });
        executor.forward_value_to_linked_inputs(
            self.node.id.output(index),
            value,
            self.task,
            self.run_state,
        );
    }

    fn output_was_set(&self, index: usize) -> bool {
        self.outputs_set[index]
    }

    fn get_output_usage(&self, index: usize) -> ValueUsage {
        self.output_usages[index]
    }

    fn set_input_unused(&mut self, index: usize) {
        self.inputs[index] = None;

        let executor = self.run_state.executor;
        executor.with_locked_node(self.node, self.task, self.run_state, |locked| {
            executor.set_input_unused(locked, index);
        });
    }
}
