use std::any::Any;
use std::fmt::Debug;

use crate::function::{Context, FuncInput, FuncOutput, LazyFunction, Params};
use crate::value::{Value, ValueType, ValueUsage};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Math2ArgOp {
    Add,
    Multiply,
}

impl Math2ArgOp {
    fn apply(self, a: i64, b: i64) -> i64 {
        match self {
            Math2ArgOp::Add => a.wrapping_add(b),
            Math2ArgOp::Multiply => a.wrapping_mul(b),
        }
    }
}

/// Both inputs are always used; the single output is computed when requested.
#[derive(Debug)]
struct Math2ArgFunction {
    op: Math2ArgOp,
    name: &'static str,
    inputs: Vec<FuncInput>,
    outputs: Vec<FuncOutput>,
}

impl Math2ArgFunction {
    fn new(op: Math2ArgOp, name: &'static str, output_name: &str) -> Self {
        let int_type = ValueType::of::<i64>();
        Math2ArgFunction {
            op,
            name,
            inputs: vec![
                FuncInput::new("a", int_type, ValueUsage::Used),
                FuncInput::new("b", int_type, ValueUsage::Used),
            ],
            outputs: vec![FuncOutput::new(output_name, int_type)],
        }
    }

    fn execute(&self, params: &mut dyn Params) {
        let Some(a) = params.get_input::<i64>(0).copied() else {
            return;
        };
        let Some(b) = params.get_input::<i64>(1).copied() else {
            return;
        };

        params.set_output_value(0, self.op.apply(a, b));
    }
}

#[derive(Debug)]
pub struct AddFunction(Math2ArgFunction);

#[derive(Debug)]
pub struct MultiplyFunction(Math2ArgFunction);

impl AddFunction {
    pub fn new() -> Self {
        AddFunction(Math2ArgFunction::new(Math2ArgOp::Add, "add", "sum"))
    }
}

impl MultiplyFunction {
    pub fn new() -> Self {
        MultiplyFunction(Math2ArgFunction::new(
            Math2ArgOp::Multiply,
            "multiply",
            "product",
        ))
    }
}

impl Default for AddFunction {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for MultiplyFunction {
    fn default() -> Self {
        Self::new()
    }
}

impl LazyFunction for AddFunction {
    fn debug_name(&self) -> &str {
        self.0.name
    }

    fn inputs(&self) -> &[FuncInput] {
        &self.0.inputs
    }

    fn outputs(&self) -> &[FuncOutput] {
        &self.0.outputs
    }

    fn execute(&self, params: &mut dyn Params, _context: &mut Context<'_>) {
        self.0.execute(params);
    }
}

impl LazyFunction for MultiplyFunction {
    fn debug_name(&self) -> &str {
        self.0.name
    }

    fn inputs(&self) -> &[FuncInput] {
        &self.0.inputs
    }

    fn outputs(&self) -> &[FuncOutput] {
        &self.0.outputs
    }

    fn execute(&self, params: &mut dyn Params, _context: &mut Context<'_>) {
        self.0.execute(params);
    }
}

/// Outputs a copy of a fixed value.
pub struct ConstantFunction {
    value: Value,
    value_type: ValueType,
    outputs: Vec<FuncOutput>,
}

impl ConstantFunction {
    pub fn new<T>(value: T) -> Self
    where
        T: Any + Clone + Default + Debug + Send + Sync,
    {
        let value_type = ValueType::of::<T>();
        ConstantFunction {
            value: Box::new(value),
            value_type,
            outputs: vec![FuncOutput::new("value", value_type)],
        }
    }
}

impl LazyFunction for ConstantFunction {
    fn debug_name(&self) -> &str {
        "constant"
    }

    fn inputs(&self) -> &[FuncInput] {
        &[]
    }

    fn outputs(&self) -> &[FuncOutput] {
        &self.outputs
    }

    fn execute(&self, params: &mut dyn Params, _context: &mut Context<'_>) {
        if params.get_output_usage(0) != ValueUsage::Unused && !params.output_was_set(0) {
            params.set_output(0, self.value_type.copy_value(&self.value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic_params::execute_eagerly;

    #[test]
    fn constant_outputs_copies() {
        let constant = ConstantFunction::new(vec![1u8, 2, 3]);

        let first = execute_eagerly(&constant, Vec::new(), None);
        let second = execute_eagerly(&constant, Vec::new(), None);

        assert_eq!(first[0].downcast_ref::<Vec<u8>>(), Some(&vec![1, 2, 3]));
        assert_eq!(second[0].downcast_ref::<Vec<u8>>(), Some(&vec![1, 2, 3]));
    }

    #[test]
    fn declared_signature() {
        let add = AddFunction::new();

        assert_eq!(add.debug_name(), "add");
        assert_eq!(add.input_name(1), "b");
        assert_eq!(add.output_name(0), "sum");
        assert!(add
            .inputs()
            .iter()
            .all(|input| input.usage == ValueUsage::Used));
    }
}
