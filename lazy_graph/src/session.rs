use std::any::Any;
use std::sync::Arc;

use crate::basic_params::BasicParams;
use crate::common::any_state::AnyState;
use crate::function::{Context, LazyFunction, Params};
use crate::value::{Value, ValueUsage};

/// Drives a lazy function from the outside: the caller requests outputs, supplies inputs
/// the function asked for and calls [`GraphSession::execute`] until the outputs are set.
///
/// Storage survives between calls, so a [`crate::graph_executor::GraphExecutor`] keeps its
/// per-node progress.
pub struct GraphSession<'f> {
    function: &'f dyn LazyFunction,
    storage: Option<AnyState>,
    params: BasicParams,
    user_data: Option<Arc<dyn Any + Send + Sync>>,
}

impl<'f> GraphSession<'f> {
    pub fn new(function: &'f dyn LazyFunction) -> Self {
        GraphSession {
            function,
            storage: Some(function.init_storage()),
            params: BasicParams::for_function(function),
            user_data: None,
        }
    }

    pub fn with_user_data(mut self, user_data: Arc<dyn Any + Send + Sync>) -> Self {
        self.user_data = Some(user_data);
        self
    }

    pub fn request_output(&mut self, index: usize) {
        self.params.set_output_usage(index, ValueUsage::Used);
    }

    pub fn discard_output(&mut self, index: usize) {
        self.params.set_output_usage(index, ValueUsage::Unused);
    }

    pub fn supply_input(&mut self, index: usize, value: Value) {
        debug_assert!(
            self.function.inputs()[index].value_type.matches(&value),
            "Input {index} expects {:?}",
            self.function.inputs()[index].value_type
        );
        self.params.set_input(index, value);
    }

    /// `Used` once the function requested the input, `Unused` once it will never read it.
    pub fn input_usage(&self, index: usize) -> ValueUsage {
        self.params.input_usage(index)
    }

    pub fn output_is_set(&self, index: usize) -> bool {
        self.params.output_was_set(index)
    }

    pub fn take_output(&mut self, index: usize) -> Option<Value> {
        self.params.take_output(index)
    }

    pub fn take_output_value<T: Any>(&mut self, index: usize) -> Option<T> {
        self.take_output(index)
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    pub fn execute(&mut self) {
        let storage = self.storage.get_or_insert_with(|| self.function.init_storage());
        let mut context = Context {
            storage,
            user_data: self.user_data.as_deref(),
        };

        self.function.execute(&mut self.params, &mut context);
    }
}

impl Drop for GraphSession<'_> {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            self.function.destruct_storage(storage);
        }
    }
}
