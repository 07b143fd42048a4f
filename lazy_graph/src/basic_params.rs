use crate::common::any_state::AnyState;
use crate::function::{Context, LazyFunction, Params};
use crate::graph_executor::UserData;
use crate::value::{Value, ValueUsage};

/// Params backed by plain vectors. Used to call a function outside of a graph.
#[derive(Debug)]
pub struct BasicParams {
    inputs: Vec<Option<Value>>,
    input_usages: Vec<ValueUsage>,
    outputs: Vec<Option<Value>>,
    output_usages: Vec<ValueUsage>,
    outputs_set: Vec<bool>,
}

impl BasicParams {
    pub fn new(inputs: Vec<Option<Value>>, output_usages: Vec<ValueUsage>) -> Self {
        BasicParams {
            input_usages: vec![ValueUsage::Maybe; inputs.len()],
            inputs,
            outputs: output_usages.iter().map(|_| None).collect(),
            outputs_set: vec![false; output_usages.len()],
            output_usages,
        }
    }

    pub fn for_function(function: &dyn LazyFunction) -> Self {
        BasicParams::new(
            function.inputs().iter().map(|_| None).collect(),
            vec![ValueUsage::Maybe; function.outputs().len()],
        )
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Usage the function reported for an input: `Used` once requested, `Unused` once discarded.
    pub fn input_usage(&self, index: usize) -> ValueUsage {
        self.input_usages[index]
    }

    /// Inputs the function reported `Unused` drop the value.
    pub fn set_input(&mut self, index: usize, value: Value) {
        if self.input_usages[index] == ValueUsage::Unused {
            return;
        }
        self.inputs[index] = Some(value);
    }

    pub fn set_output_usage(&mut self, index: usize, usage: ValueUsage) {
        self.output_usages[index] = usage;
    }

    pub fn take_output(&mut self, index: usize) -> Option<Value> {
        if !self.outputs_set[index] {
            return None;
        }
        self.outputs[index].take()
    }
}

impl Params for BasicParams {
    fn try_get_input(&mut self, index: usize) -> Option<&Value> {
        self.inputs[index].as_ref()
    }

    fn try_get_input_or_request(&mut self, index: usize) -> Option<&Value> {
        if self.inputs[index].is_none() && self.input_usages[index] == ValueUsage::Maybe {
            self.input_usages[index] = ValueUsage::Used;
        }
        self.inputs[index].as_ref()
    }

    fn try_extract_input(&mut self, index: usize) -> Option<Value> {
        self.inputs[index].take()
    }

    fn output_slot(&mut self, index: usize) -> &mut Option<Value> {
        &mut self.outputs[index]
    }

    fn output_set(&mut self, index: usize) {
        debug_assert!(!self.outputs_set[index], "Output {index} set twice");
        debug_assert!(self.outputs[index].is_some());
        self.outputs_set[index] = true;
    }

    fn output_was_set(&self, index: usize) -> bool {
        self.outputs_set[index]
    }

    fn get_output_usage(&self, index: usize) -> ValueUsage {
        self.output_usages[index]
    }

    fn set_input_unused(&mut self, index: usize) {
        self.input_usages[index] = ValueUsage::Unused;
        self.inputs[index] = None;
    }
}

/// Runs `function` once with every input provided and every output used.
///
/// Panics if the function leaves an output unset.
pub fn execute_eagerly(
    function: &dyn LazyFunction,
    inputs: Vec<Value>,
    user_data: UserData<'_>,
) -> Vec<Value> {
    assert_eq!(inputs.len(), function.inputs().len());

    let mut params = BasicParams::new(
        inputs.into_iter().map(Some).collect(),
        vec![ValueUsage::Used; function.outputs().len()],
    );
    let mut storage: AnyState = function.init_storage();
    {
        let mut context = Context {
            storage: &mut storage,
            user_data,
        };
        function.execute(&mut params, &mut context);
    }
    function.destruct_storage(storage);

    (0..params.output_count())
        .map(|index| {
            params.take_output(index).unwrap_or_else(|| {
                panic!(
                    "{} did not compute output {}",
                    function.debug_name(),
                    function.output_name(index)
                )
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elements::basic_funcs::{AddFunction, MultiplyFunction};

    #[test]
    fn eager_add() {
        let outputs = execute_eagerly(
            &AddFunction::new(),
            vec![Box::new(3i64) as Value, Box::new(4i64) as Value],
            None,
        );

        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].downcast_ref::<i64>(), Some(&7));
    }

    #[test]
    fn request_marks_usage() {
        let mut params = BasicParams::new(
            vec![None, Some(Box::new(2i64) as Value)],
            vec![ValueUsage::Used],
        );

        assert!(params.try_get_input_or_request(0).is_none());
        assert_eq!(params.input_usage(0), ValueUsage::Used);
        assert!(params.try_get_input_or_request(1).is_some());
        assert_eq!(params.input_usage(1), ValueUsage::Maybe);

        params.set_input_unused(1);
        assert!(params.try_get_input(1).is_none());
        assert_eq!(params.input_usage(1), ValueUsage::Unused);

        params.set_input(1, Box::new(3i64));
        assert!(params.try_get_input(1).is_none());
    }

    #[test]
    fn typed_helpers() {
        let mut params = BasicParams::new(
            vec![Some(Box::new(6i64) as Value), Some(Box::new(7i64) as Value)],
            vec![ValueUsage::Used],
        );
        let params: &mut dyn Params = &mut params;

        assert_eq!(params.get_input::<i64>(0), Some(&6));
        assert_eq!(params.extract_input::<i64>(1), Some(7));
        assert_eq!(params.extract_input::<i64>(1), None);
        assert!(params.output_is_required(0));

        params.set_output_value(0, 42i64);
        assert!(params.output_was_set(0));
        assert!(!params.output_is_required(0));
    }

    #[test]
    fn eager_multiply() {
        let outputs = execute_eagerly(
            &MultiplyFunction::new(),
            vec![Box::new(3i64) as Value, Box::new(5i64) as Value],
            None,
        );

        assert_eq!(outputs[0].downcast_ref::<i64>(), Some(&15));
    }
}
