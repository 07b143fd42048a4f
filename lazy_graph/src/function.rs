use std::any::Any;

use crate::common::any_state::AnyState;
use crate::value::{Value, ValueType, ValueUsage};

#[derive(Clone, Debug)]
pub struct FuncInput {
    pub debug_name: String,
    pub value_type: ValueType,
    /// `Used` means the input is required no matter which outputs are requested.
    /// `Maybe` inputs are requested by the function body on demand.
    pub usage: ValueUsage,
}

#[derive(Clone, Debug)]
pub struct FuncOutput {
    pub debug_name: String,
    pub value_type: ValueType,
}

impl FuncInput {
    pub fn new(debug_name: impl Into<String>, value_type: ValueType, usage: ValueUsage) -> Self {
        debug_assert_ne!(usage, ValueUsage::Unused);
        Self {
            debug_name: debug_name.into(),
            value_type,
            usage,
        }
    }
}

impl FuncOutput {
    pub fn new(debug_name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            debug_name: debug_name.into(),
            value_type,
        }
    }
}

pub struct Context<'a> {
    pub storage: &'a mut AnyState,
    pub user_data: Option<&'a (dyn Any + Send + Sync)>,
}

/// A computation that can be evaluated lazily: it may be invoked several times, each time
/// reading whatever inputs are available and computing whatever outputs it can.
pub trait LazyFunction: Send + Sync {
    fn debug_name(&self) -> &str;
    fn inputs(&self) -> &[FuncInput];
    fn outputs(&self) -> &[FuncOutput];

    /// Allows the executor to run the function before all requested inputs are available.
    fn allow_missing_requested_inputs(&self) -> bool {
        false
    }

    fn init_storage(&self) -> AnyState {
        AnyState::default()
    }

    fn destruct_storage(&self, storage: AnyState) {
        drop(storage);
    }

    /// Reads available inputs and writes required outputs through `params`.
    /// References obtained from `params` must not outlive the call.
    fn execute(&self, params: &mut dyn Params, context: &mut Context<'_>);

    fn input_name(&self, index: usize) -> &str {
        &self.inputs()[index].debug_name
    }

    fn output_name(&self, index: usize) -> &str {
        &self.outputs()[index].debug_name
    }
}

pub trait Params: Send {
    fn try_get_input(&mut self, index: usize) -> Option<&Value>;

    fn try_get_input_or_request(&mut self, index: usize) -> Option<&Value>;

    fn try_extract_input(&mut self, index: usize) -> Option<Value>;

    fn output_slot(&mut self, index: usize) -> &mut Option<Value>;

    /// Marks the output as computed. Must be called once per output at most.
    fn output_set(&mut self, index: usize);

    fn output_was_set(&self, index: usize) -> bool;

    fn get_output_usage(&self, index: usize) -> ValueUsage;

    fn set_input_unused(&mut self, index: usize);

    fn set_output(&mut self, index: usize, value: Value) {
        debug_assert!(!self.output_was_set(index), "Output {index} set twice");
        *self.output_slot(index) = Some(value);
        self.output_set(index);
    }
}

impl<'a> dyn Params + 'a {
    pub fn get_input<T: Any>(&mut self, index: usize) -> Option<&T> {
        self.try_get_input(index)
            .map(|value| downcast_input::<T>(value, index))
    }

    pub fn get_input_or_request<T: Any>(&mut self, index: usize) -> Option<&T> {
        self.try_get_input_or_request(index)
            .map(|value| downcast_input::<T>(value, index))
    }

    pub fn extract_input<T: Any>(&mut self, index: usize) -> Option<T> {
        self.try_extract_input(index).map(|value| {
            *value
                .downcast::<T>()
                .unwrap_or_else(|_| panic!("Input {index} is not a {}", std::any::type_name::<T>()))
        })
    }

    pub fn set_output_value<T: Any + Send + Sync>(&mut self, index: usize, value: T) {
        self.set_output(index, Box::new(value));
    }

    pub fn output_is_required(&self, index: usize) -> bool {
        self.get_output_usage(index) == ValueUsage::Used && !self.output_was_set(index)
    }
}

fn downcast_input<T: Any>(value: &Value, index: usize) -> &T {
    value
        .downcast_ref::<T>()
        .unwrap_or_else(|| panic!("Input {index} is not a {}", std::any::type_name::<T>()))
}

pub fn always_used_inputs_available(function: &dyn LazyFunction, params: &mut dyn Params) -> bool {
    if function.allow_missing_requested_inputs() {
        return true;
    }

    function
        .inputs()
        .iter()
        .enumerate()
        .filter(|(_, input)| input.usage == ValueUsage::Used)
        .all(|(index, _)| params.try_get_input(index).is_some())
}
