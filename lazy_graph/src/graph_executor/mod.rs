use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::is_debug;
use hashbrown::HashMap;
use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{debug, trace, warn};

use crate::common::any_state::AnyState;
use crate::config::{self, ExecutorConfig};
use crate::function::{always_used_inputs_available, Context, FuncInput, FuncOutput, LazyFunction, Params};
use crate::graph::{Graph, InputSocketId, Node, NodeId, OutputSocketId};
use crate::value::{Value, ValueUsage};

pub mod logger;
mod node_state;
mod params;
#[cfg(test)]
mod tests;

pub use logger::{ExecutorLogger, SideEffectProvider, TracingLogger, UserData};
use node_state::{DeferredActions, LockedNode, NodeScheduleState, NodeState};
use params::GraphParams;

// === Graph Executor ===

/// Evaluates a [`Graph`] lazily. The graph boundary is a list of dummy-node outputs acting as
/// graph inputs and a list of dummy-node inputs acting as graph outputs.
///
/// A `GraphExecutor` is itself a [`LazyFunction`], so it can be a node of another graph.
/// Per-call state lives in an [`Executor`] kept in the function storage.
pub struct GraphExecutor {
    inner: Arc<GraphExecutorInner>,
}

struct GraphExecutorInner {
    name: String,
    graph: Arc<Graph>,
    graph_inputs: Vec<OutputSocketId>,
    graph_outputs: Vec<InputSocketId>,
    graph_input_index: HashMap<OutputSocketId, usize>,
    graph_output_index: HashMap<InputSocketId, usize>,
    inputs: Vec<FuncInput>,
    outputs: Vec<FuncOutput>,
    logger: Option<Arc<dyn ExecutorLogger>>,
    side_effect_provider: Option<Arc<dyn SideEffectProvider>>,
    config: ExecutorConfig,
    thread_pool: Option<rayon::ThreadPool>,
}

pub struct GraphExecutorBuilder {
    name: String,
    graph: Arc<Graph>,
    graph_inputs: Vec<OutputSocketId>,
    graph_outputs: Vec<InputSocketId>,
    logger: Option<Arc<dyn ExecutorLogger>>,
    side_effect_provider: Option<Arc<dyn SideEffectProvider>>,
    config: ExecutorConfig,
}

impl GraphExecutorBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn logger(mut self, logger: Arc<dyn ExecutorLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn side_effect_provider(mut self, provider: Arc<dyn SideEffectProvider>) -> Self {
        self.side_effect_provider = Some(provider);
        self
    }

    pub fn config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> config::Result<GraphExecutor> {
        self.config.validate()?;

        let graph = self.graph;
        graph.validate_structure();

        for socket in self.graph_inputs.iter() {
            assert!(
                graph.node(socket.node).is_dummy(),
                "Graph input {socket:?} must be an output of a dummy node"
            );
        }
        for socket in self.graph_outputs.iter() {
            assert!(
                graph.node(socket.node).is_dummy(),
                "Graph output {socket:?} must be an input of a dummy node"
            );
        }

        let graph_input_index: HashMap<OutputSocketId, usize> = self
            .graph_inputs
            .iter()
            .enumerate()
            .map(|(index, socket)| (*socket, index))
            .collect();
        let graph_output_index: HashMap<InputSocketId, usize> = self
            .graph_outputs
            .iter()
            .enumerate()
            .map(|(index, socket)| (*socket, index))
            .collect();
        assert_eq!(graph_input_index.len(), self.graph_inputs.len());
        assert_eq!(graph_output_index.len(), self.graph_outputs.len());

        let inputs = self
            .graph_inputs
            .iter()
            .map(|socket| {
                let output = graph.output(*socket);
                FuncInput::new(output.name.clone(), output.value_type, ValueUsage::Maybe)
            })
            .collect();
        let outputs = self
            .graph_outputs
            .iter()
            .map(|socket| {
                let input = graph.input(*socket);
                FuncOutput::new(input.name.clone(), input.value_type)
            })
            .collect();

        let thread_pool = match self.config.thread_count {
            Some(thread_count) if self.config.multi_threading => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(thread_count)
                    .thread_name(|index| format!("lazy-graph-{index}"))
                    .build()?,
            ),
            _ => None,
        };

        Ok(GraphExecutor {
            inner: Arc::new(GraphExecutorInner {
                name: self.name,
                graph,
                graph_inputs: self.graph_inputs,
                graph_outputs: self.graph_outputs,
                graph_input_index,
                graph_output_index,
                inputs,
                outputs,
                logger: self.logger,
                side_effect_provider: self.side_effect_provider,
                config: self.config,
                thread_pool,
            }),
        })
    }
}

impl GraphExecutor {
    pub fn builder(
        graph: Arc<Graph>,
        graph_inputs: Vec<OutputSocketId>,
        graph_outputs: Vec<InputSocketId>,
    ) -> GraphExecutorBuilder {
        GraphExecutorBuilder {
            name: "graph".to_string(),
            graph,
            graph_inputs,
            graph_outputs,
            logger: None,
            side_effect_provider: None,
            config: ExecutorConfig::default(),
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.inner.graph
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }
}

impl LazyFunction for GraphExecutor {
    fn debug_name(&self) -> &str {
        &self.inner.name
    }

    fn inputs(&self) -> &[FuncInput] {
        &self.inner.inputs
    }

    fn outputs(&self) -> &[FuncOutput] {
        &self.inner.outputs
    }

    fn allow_missing_requested_inputs(&self) -> bool {
        true
    }

    fn init_storage(&self) -> AnyState {
        AnyState::new(Executor::new(Arc::clone(&self.inner)))
    }

    fn execute(&self, params: &mut dyn Params, context: &mut Context<'_>) {
        let user_data = context.user_data;
        if !context.storage.is::<Executor>() {
            *context.storage = self.init_storage();
        }
        let Some(executor) = context.storage.get_mut::<Executor>() else {
            return;
        };
        debug_assert!(Arc::ptr_eq(&executor.inner, &self.inner));

        executor.execute(params, user_data);
    }
}

// === Executor ===

/// State of one evaluation of a graph. Survives repeated `execute` calls made while the
/// caller supplies inputs and requests outputs.
pub struct Executor {
    inner: Arc<GraphExecutorInner>,
    node_states: Vec<Mutex<NodeState>>,
    /// Set once a graph input has been moved in and forwarded.
    loaded_inputs: Vec<AtomicBool>,
    is_first_execution: bool,
}

/// Data shared by every thread taking part in one `execute` call.
pub(crate) struct RunState<'a, 'p> {
    executor: &'a Executor,
    params: Mutex<&'a mut (dyn Params + 'p)>,
    user_data: UserData<'a>,
}

/// Nodes scheduled by the current thread. The first one is run by the same thread,
/// the rest go to the pool.
#[derive(Debug, Default)]
pub(crate) struct CurrentTask {
    next_node: Option<NodeId>,
    pool_nodes: Vec<NodeId>,
}

impl CurrentTask {
    fn add_node(&mut self, node: NodeId) {
        if self.next_node.is_none() {
            self.next_node = Some(node);
        } else {
            self.pool_nodes.push(node);
        }
    }
}

struct PreparedExecution {
    inputs: Vec<Option<Value>>,
    /// `None` if the storage has to be created.
    storage: Option<AnyState>,
    output_usages: Vec<ValueUsage>,
    outputs_set: Vec<bool>,
}

struct FinishedExecution {
    inputs: Vec<Option<Value>>,
    storage: AnyState,
}

impl Executor {
    fn new(inner: Arc<GraphExecutorInner>) -> Executor {
        let make_state = |node: &Node| {
            Mutex::new(NodeState::new(node, &inner.graph_input_index))
        };

        let nodes = inner.graph.nodes();
        let node_states: Vec<Mutex<NodeState>> =
            if nodes.len() >= inner.config.parallel_state_init_threshold {
                nodes.par_iter().map(make_state).collect()
            } else {
                nodes.iter().map(make_state).collect()
            };
        let loaded_inputs = inner
            .graph_inputs
            .iter()
            .map(|_| AtomicBool::new(false))
            .collect();

        Executor {
            inner,
            node_states,
            loaded_inputs,
            is_first_execution: true,
        }
    }

    /// Makes as much progress as the currently available inputs and requested outputs allow.
    pub fn execute(&mut self, params: &mut dyn Params, user_data: UserData<'_>) {
        let is_first_execution = std::mem::replace(&mut self.is_first_execution, false);

        let run_state = RunState {
            executor: &*self,
            params: Mutex::new(params),
            user_data,
        };
        let mut task = CurrentTask::default();

        if is_first_execution {
            self.initialize_first_execution(&mut task, &run_state);
        }
        self.schedule_for_new_output_usages(&mut task, &run_state);
        self.forward_newly_provided_inputs(&mut task, &run_state);
        self.run_scheduled_nodes(&mut task, &run_state);
    }

    // === Initialization ===

    fn initialize_first_execution(&self, task: &mut CurrentTask, run_state: &RunState<'_, '_>) {
        let side_effect_nodes: Vec<NodeId> = self
            .inner
            .side_effect_provider
            .as_ref()
            .map(|provider| provider.nodes_with_side_effects(run_state.user_data))
            .unwrap_or_default()
            .into_iter()
            .filter(|node| {
                let is_function = !self.inner.graph.node(*node).is_dummy();
                if !is_function {
                    warn!("Ignoring side effects of dummy node {node:?}");
                }
                is_function
            })
            .collect();

        self.initialize_usages(&side_effect_nodes);
        self.set_always_unused_graph_inputs(run_state);
        self.set_defaulted_graph_outputs(run_state);

        for node in side_effect_nodes {
            let node = self.inner.graph.node(node);
            self.with_locked_node(node, task, run_state, |locked| {
                self.schedule_node(locked);
            });
        }

        debug!(
            "Initialized {} node states for {}",
            self.node_states.len(),
            self.inner.name
        );
    }

    /// Nodes from which neither a graph output nor a side-effect node can be reached
    /// are never needed. Only reachable targets count as potential consumers.
    fn initialize_usages(&self, side_effect_nodes: &[NodeId]) {
        let graph = &self.inner.graph;
        let mut reachable = vec![false; graph.node_count()];
        let mut stack: Vec<NodeId> = self
            .inner
            .graph_outputs
            .iter()
            .map(|socket| socket.node)
            .chain(side_effect_nodes.iter().copied())
            .collect();

        while let Some(node) = stack.pop() {
            if std::mem::replace(&mut reachable[node.index()], true) {
                continue;
            }
            stack.extend(
                graph
                    .node(node)
                    .inputs
                    .iter()
                    .filter_map(|input| input.origin)
                    .map(|origin| origin.node)
                    .filter(|origin| !reachable[origin.index()]),
            );
        }

        for node in graph.nodes() {
            let mut state = self.node_states[node.id.index()].lock();

            if !reachable[node.id.index()] {
                for input_state in state.inputs.iter_mut() {
                    input_state.usage = ValueUsage::Unused;
                }
            }
            for (output, output_state) in node.outputs.iter().zip(state.outputs.iter_mut()) {
                output_state.potential_target_sockets = output
                    .targets
                    .iter()
                    .filter(|target| reachable[target.node.index()])
                    .count();
                if output_state.potential_target_sockets == 0 {
                    output_state.usage = ValueUsage::Unused;
                }
            }
        }

        for node in side_effect_nodes {
            self.node_states[node.index()].lock().has_side_effects = true;
        }
    }

    fn set_always_unused_graph_inputs(&self, run_state: &RunState<'_, '_>) {
        let unused: Vec<usize> = self
            .inner
            .graph_inputs
            .iter()
            .enumerate()
            .filter(|(_, socket)| {
                self.node_states[socket.node.index()].lock().outputs[socket.index].usage
                    == ValueUsage::Unused
            })
            .map(|(index, _)| index)
            .collect();

        let mut params = run_state.params.lock();
        for index in unused {
            params.set_input_unused(index);
        }
    }

    fn set_defaulted_graph_outputs(&self, run_state: &RunState<'_, '_>) {
        for (index, socket) in self.inner.graph_outputs.iter().enumerate() {
            let input = self.inner.graph.input(*socket);
            if input.origin.is_some() {
                continue;
            }

            let value = input.default_value.as_ref().map_or_else(
                || input.value_type.default_value(),
                |value| input.value_type.copy_value(value),
            );
            run_state.params.lock().set_output(index, value);
        }
    }

    // === Boundary ===

    fn schedule_for_new_output_usages(&self, task: &mut CurrentTask, run_state: &RunState<'_, '_>) {
        for (index, socket) in self.inner.graph_outputs.iter().enumerate() {
            let usage = {
                let params = run_state.params.lock();
                if params.output_was_set(index) {
                    continue;
                }
                params.get_output_usage(index)
            };

            let node = self.inner.graph.node(socket.node);
            match usage {
                ValueUsage::Used => self.with_locked_node(node, task, run_state, |locked| {
                    if locked.state.inputs[socket.index].usage != ValueUsage::Used {
                        self.set_input_required(locked, socket.index);
                    }
                }),
                ValueUsage::Unused => self.with_locked_node(node, task, run_state, |locked| {
                    self.set_input_unused(locked, socket.index);
                }),
                ValueUsage::Maybe => {}
            }
        }
    }

    fn forward_newly_provided_inputs(&self, task: &mut CurrentTask, run_state: &RunState<'_, '_>) {
        for (index, socket) in self.inner.graph_inputs.iter().enumerate() {
            if self.loaded_inputs[index].load(Ordering::Acquire) {
                continue;
            }

            let value = {
                let mut params = run_state.params.lock();
                if params.try_get_input(index).is_none()
                    || self.loaded_inputs[index].swap(true, Ordering::AcqRel)
                {
                    continue;
                }
                params.try_extract_input(index)
            };

            if let Some(value) = value {
                self.forward_value_to_linked_inputs(*socket, value, task, run_state);
            }
        }
    }

    // === Scheduling ===

    fn run_scheduled_nodes(&self, task: &mut CurrentTask, run_state: &RunState<'_, '_>) {
        loop {
            if self.inner.config.multi_threading && !task.pool_nodes.is_empty() {
                let next_node = task.next_node.take();
                let pool_nodes = std::mem::take(&mut task.pool_nodes);
                self.run_in_pool(next_node, pool_nodes, run_state);
                return;
            }

            let Some(node) = task.next_node.take().or_else(|| task.pool_nodes.pop()) else {
                return;
            };
            self.run_node_task(node, task, run_state);
        }
    }

    /// Spawns `pool_nodes` and runs `next_node` on the calling thread until the scope drains.
    fn run_in_pool(
        &self,
        next_node: Option<NodeId>,
        pool_nodes: Vec<NodeId>,
        run_state: &RunState<'_, '_>,
    ) {
        trace!("Handing {} nodes to the thread pool", pool_nodes.len());

        match &self.inner.thread_pool {
            Some(pool) => pool.in_place_scope(|scope| {
                run_scope_root(scope, next_node, pool_nodes, run_state)
            }),
            None => rayon::in_place_scope(|scope| {
                run_scope_root(scope, next_node, pool_nodes, run_state)
            }),
        }
    }

    fn schedule_node(&self, locked: &mut LockedNode<'_>) {
        debug_assert!(!locked.node.is_dummy());

        let state = &mut *locked.state;
        match state.schedule_state {
            NodeScheduleState::NotScheduled => {
                state.schedule_state = NodeScheduleState::Scheduled;
                locked.deferred.scheduled_nodes.push(locked.node.id);
            }
            NodeScheduleState::Running => {
                state.schedule_state = NodeScheduleState::RunningAndRescheduled;
            }
            NodeScheduleState::Scheduled | NodeScheduleState::RunningAndRescheduled => {}
        }
    }

    fn with_locked_node<R>(
        &self,
        node: &Node,
        task: &mut CurrentTask,
        run_state: &RunState<'_, '_>,
        f: impl FnOnce(&mut LockedNode<'_>) -> R,
    ) -> R {
        let mut locked = LockedNode::new(node, self.node_states[node.id.index()].lock());
        let result = f(&mut locked);

        let deferred = locked.unlock();
        if !deferred.is_empty() {
            self.send_deferred(deferred, task, run_state);
        }

        result
    }

    fn send_deferred(&self, deferred: DeferredActions, task: &mut CurrentTask, run_state: &RunState<'_, '_>) {
        for socket in deferred.required_outputs {
            self.notify_output_required(socket, task, run_state);
        }
        for socket in deferred.unused_outputs {
            self.notify_output_unused(socket, task, run_state);
        }
        if !deferred.unused_graph_inputs.is_empty() {
            let mut params = run_state.params.lock();
            for index in deferred.unused_graph_inputs {
                params.set_input_unused(index);
            }
        }
        for node in deferred.scheduled_nodes {
            task.add_node(node);
        }
    }

    // === Usage Propagation ===

    fn notify_output_required(&self, socket: OutputSocketId, task: &mut CurrentTask, run_state: &RunState<'_, '_>) {
        let node = self.inner.graph.node(socket.node);

        if node.is_dummy() {
            let Some(&index) = self.inner.graph_input_index.get(&socket) else {
                return;
            };
            if self.loaded_inputs[index].load(Ordering::Acquire) {
                return;
            }

            let value = {
                let mut params = run_state.params.lock();
                if params.try_get_input_or_request(index).is_none()
                    || self.loaded_inputs[index].swap(true, Ordering::AcqRel)
                {
                    return;
                }
                params.try_extract_input(index)
            };
            if let Some(value) = value {
                self.forward_value_to_linked_inputs(socket, value, task, run_state);
            }
            return;
        }

        self.with_locked_node(node, task, run_state, |locked| {
            let output_state = &mut locked.state.outputs[socket.index];
            if output_state.usage == ValueUsage::Used {
                return;
            }
            debug_assert_ne!(output_state.usage, ValueUsage::Unused);
            output_state.usage = ValueUsage::Used;
            self.schedule_node(locked);
        });
    }

    fn notify_output_unused(&self, socket: OutputSocketId, task: &mut CurrentTask, run_state: &RunState<'_, '_>) {
        let node = self.inner.graph.node(socket.node);

        self.with_locked_node(node, task, run_state, |locked| {
            let output_state = &mut locked.state.outputs[socket.index];
            debug_assert!(output_state.potential_target_sockets > 0);
            output_state.potential_target_sockets -= 1;
            if output_state.potential_target_sockets > 0 || output_state.usage != ValueUsage::Maybe {
                return;
            }

            output_state.usage = ValueUsage::Unused;
            if node.is_dummy() {
                if let Some(index) = output_state.graph_input_index {
                    locked.deferred.unused_graph_inputs.push(index);
                }
            } else {
                // the node may be able to finish now
                self.schedule_node(locked);
            }
        });
    }

    /// Returns true if the value is available already.
    pub(crate) fn set_input_required(&self, locked: &mut LockedNode<'_>, index: usize) -> bool {
        let state = &mut *locked.state;
        let input_state = &mut state.inputs[index];
        debug_assert_ne!(input_state.usage, ValueUsage::Unused);

        if input_state.was_ready_for_execution {
            return true;
        }
        if input_state.value.is_some() {
            input_state.was_ready_for_execution = true;
            return true;
        }
        if input_state.usage != ValueUsage::Maybe {
            return false;
        }

        input_state.usage = ValueUsage::Used;
        state.missing_required_inputs += 1;

        match locked.node.inputs[index].origin {
            Some(origin) => locked.deferred.required_outputs.push(origin),
            None => debug_assert!(false, "Unlinked input {index} of {} has no value", locked.node.name()),
        }

        false
    }

    pub(crate) fn set_input_unused(&self, locked: &mut LockedNode<'_>, index: usize) {
        let state = &mut *locked.state;
        let input_state = &mut state.inputs[index];

        let old_usage = input_state.usage;
        if old_usage == ValueUsage::Unused {
            return;
        }
        input_state.usage = ValueUsage::Unused;

        let had_value = input_state.value.take().is_some();
        if input_state.was_ready_for_execution {
            return;
        }
        if old_usage == ValueUsage::Used && !had_value {
            state.missing_required_inputs -= 1;
        }

        if let Some(origin) = locked.node.inputs[index].origin {
            locked.deferred.unused_outputs.push(origin);
        }
    }

    // === Node Execution ===

    fn run_node_task(&self, node: NodeId, task: &mut CurrentTask, run_state: &RunState<'_, '_>) {
        let node = self.inner.graph.node(node);
        let function = node
            .function()
            .expect("Only function nodes are scheduled");

        let prepared = self.with_locked_node(node, task, run_state, |locked| {
            self.prepare_node_execution(locked, function)
        });

        let finished = prepared
            .map(|prepared| self.execute_node(node, function, prepared, task, run_state));

        self.with_locked_node(node, task, run_state, |locked| {
            let executed = finished.is_some();
            if let Some(finished) = finished {
                self.restore_after_execution(locked, finished);
            }
            if executed {
                self.assert_expected_outputs_have_been_computed(locked, run_state.user_data);
            }
            self.finish_node_if_possible(locked, function);

            let reschedule =
                locked.state.schedule_state == NodeScheduleState::RunningAndRescheduled;
            locked.state.schedule_state = NodeScheduleState::NotScheduled;
            if reschedule && !locked.state.node_has_finished {
                self.schedule_node(locked);
            }
        });
    }

    fn prepare_node_execution(
        &self,
        locked: &mut LockedNode<'_>,
        function: &dyn LazyFunction,
    ) -> Option<PreparedExecution> {
        let node = locked.node;
        let state = &mut *locked.state;
        debug_assert_eq!(state.schedule_state, NodeScheduleState::Scheduled);
        state.schedule_state = NodeScheduleState::Running;

        if state.node_has_finished {
            return None;
        }

        let mut required_uncomputed_output_exists = false;
        for output_state in state.outputs.iter_mut() {
            output_state.usage_for_execution = output_state.usage;
            required_uncomputed_output_exists |=
                output_state.usage == ValueUsage::Used && !output_state.has_been_computed;
        }
        if !required_uncomputed_output_exists && !state.has_side_effects {
            return None;
        }

        if !state.default_inputs_initialized {
            for (input, input_state) in node.inputs.iter().zip(state.inputs.iter_mut()) {
                if input.origin.is_some() || input_state.usage == ValueUsage::Unused {
                    continue;
                }
                input_state.value = Some(input.default_value.as_ref().map_or_else(
                    || input.value_type.default_value(),
                    |value| input.value_type.copy_value(value),
                ));
                input_state.was_ready_for_execution = true;
            }
            state.default_inputs_initialized = true;
        }

        if !state.always_required_inputs_handled {
            for (index, input) in function.inputs().iter().enumerate() {
                if input.usage == ValueUsage::Used && node.inputs[index].origin.is_some() {
                    self.set_input_required(locked, index);
                }
            }
            locked.state.always_required_inputs_handled = true;
        }

        let state = &mut *locked.state;
        for input_state in state.inputs.iter_mut() {
            if input_state.value.is_some() {
                input_state.was_ready_for_execution = true;
            }
        }
        if state.missing_required_inputs > 0 && !function.allow_missing_requested_inputs() {
            return None;
        }

        let storage = if state.storage_initialized {
            state.storage.take()
        } else {
            state.storage_initialized = true;
            None
        };

        Some(PreparedExecution {
            inputs: state
                .inputs
                .iter_mut()
                .map(|input_state| {
                    if input_state.was_ready_for_execution {
                        input_state.value.take()
                    } else {
                        None
                    }
                })
                .collect(),
            storage,
            output_usages: state
                .outputs
                .iter()
                .map(|output_state| output_state.usage_for_execution)
                .collect(),
            outputs_set: state
                .outputs
                .iter()
                .map(|output_state| output_state.has_been_computed)
                .collect(),
        })
    }

    /// Runs the function body without holding the node lock.
    fn execute_node(
        &self,
        node: &Node,
        function: &dyn LazyFunction,
        prepared: PreparedExecution,
        task: &mut CurrentTask,
        run_state: &RunState<'_, '_>,
    ) -> FinishedExecution {
        let PreparedExecution {
            inputs,
            storage,
            output_usages,
            outputs_set,
        } = prepared;
        let mut storage = storage.unwrap_or_else(|| function.init_storage());

        let mut params = GraphParams::new(node, task, run_state, inputs, output_usages, outputs_set);
        if is_debug() {
            debug_assert!(
                always_used_inputs_available(function, &mut params),
                "Node {} runs without its required inputs",
                node.name()
            );
        }

        if let Some(logger) = &self.inner.logger {
            logger.log_before_node_execute(node, run_state.user_data);
        }
        {
            let mut context = Context {
                storage: &mut storage,
                user_data: run_state.user_data,
            };
            function.execute(&mut params, &mut context);
        }
        if let Some(logger) = &self.inner.logger {
            logger.log_after_node_execute(node, run_state.user_data);
        }

        FinishedExecution {
            inputs: params.into_inputs(),
            storage,
        }
    }

    fn restore_after_execution(&self, locked: &mut LockedNode<'_>, finished: FinishedExecution) {
        let state = &mut *locked.state;

        for (input_state, value) in state.inputs.iter_mut().zip(finished.inputs) {
            let Some(value) = value else {
                continue;
            };
            if input_state.usage == ValueUsage::Unused {
                continue;
            }
            debug_assert!(input_state.value.is_none());
            input_state.value = Some(value);
        }

        debug_assert!(state.storage.is_none());
        state.storage = Some(finished.storage);
    }

    fn assert_expected_outputs_have_been_computed(&self, locked: &LockedNode<'_>, user_data: UserData<'_>) {
        if !is_debug() {
            return;
        }

        let state = &*locked.state;
        if state.missing_required_inputs > 0
            || state.schedule_state == NodeScheduleState::RunningAndRescheduled
        {
            return;
        }

        let missing_outputs: Vec<usize> = state
            .outputs
            .iter()
            .enumerate()
            .filter(|(_, output_state)| {
                output_state.usage_for_execution == ValueUsage::Used
                    && !output_state.has_been_computed
            })
            .map(|(index, _)| index)
            .collect();
        if missing_outputs.is_empty() {
            return;
        }

        if let Some(logger) = &self.inner.logger {
            logger.dump_when_outputs_are_missing(locked.node, &missing_outputs, user_data);
        }
        panic!(
            "Node {} did not compute required outputs {:?}",
            locked.node.name(),
            missing_outputs
        );
    }

    fn finish_node_if_possible(&self, locked: &mut LockedNode<'_>, function: &dyn LazyFunction) {
        let state = &*locked.state;
        if state.node_has_finished {
            return;
        }

        let outputs_done = state.outputs.iter().all(|output_state| {
            output_state.usage == ValueUsage::Unused || output_state.has_been_computed
        });
        let inputs_done = state.inputs.iter().all(|input_state| {
            input_state.usage != ValueUsage::Used || input_state.was_ready_for_execution
        });
        if !outputs_done || !inputs_done {
            return;
        }

        locked.state.node_has_finished = true;

        for index in 0..locked.state.inputs.len() {
            match locked.state.inputs[index].usage {
                ValueUsage::Maybe => self.set_input_unused(locked, index),
                ValueUsage::Used => locked.state.inputs[index].value = None,
                ValueUsage::Unused => {}
            }
        }

        if let Some(storage) = locked.state.storage.take() {
            function.destruct_storage(storage);
        }
    }

    // === Value Forwarding ===

    pub(crate) fn forward_value_to_linked_inputs(
        &self,
        from: OutputSocketId,
        value: Value,
        task: &mut CurrentTask,
        run_state: &RunState<'_, '_>,
    ) {
        let graph = &self.inner.graph;
        let output = graph.output(from);

        if let Some(logger) = &self.inner.logger {
            logger.log_socket_value(output, &value, run_state.user_data);
        }

        let mut value = Some(value);
        let target_count = output.targets.len();
        for (position, target) in output.targets.iter().enumerate() {
            let is_last_target = position + 1 == target_count;
            let target_node = graph.node(target.node);

            if target_node.is_dummy() {
                let Some(&graph_output_index) = self.inner.graph_output_index.get(target) else {
                    continue;
                };
                let mut params = run_state.params.lock();
                if params.get_output_usage(graph_output_index) == ValueUsage::Unused
                    || params.output_was_set(graph_output_index)
                {
                    continue;
                }
                let forwarded = if is_last_target {
                    value.take()
                } else {
                    value.as_ref().map(|value| output.value_type.copy_value(value))
                };
                if let Some(forwarded) = forwarded {
                    params.set_output(graph_output_index, forwarded);
                }
                continue;
            }

            self.with_locked_node(target_node, task, run_state, |locked| {
                if locked.state.inputs[target.index].usage == ValueUsage::Unused {
                    return;
                }
                let forwarded = if is_last_target {
                    value.take()
                } else {
                    value.as_ref().map(|value| output.value_type.copy_value(value))
                };
                if let Some(forwarded) = forwarded {
                    self.forward_value_to_input(locked, target.index, forwarded, run_state.user_data);
                }
            });
        }
        // a value no target took is dropped here
    }

    fn forward_value_to_input(
        &self,
        locked: &mut LockedNode<'_>,
        index: usize,
        value: Value,
        user_data: UserData<'_>,
    ) {
        let state = &mut *locked.state;
        let input_state = &mut state.inputs[index];

        if input_state.value.is_some() || input_state.was_ready_for_execution {
            if let Some(logger) = &self.inner.logger {
                logger.dump_when_input_is_set_twice(&self.inner.graph, locked.node.id.input(index), user_data);
            }
            debug_assert!(false, "Input {index} of {} set twice", locked.node.name());
            return;
        }

        input_state.value = Some(value);
        if input_state.usage != ValueUsage::Used {
            return;
        }

        state.missing_required_inputs -= 1;
        let allow_missing = locked
            .node
            .function()
            .is_some_and(|function| function.allow_missing_requested_inputs());
        if state.missing_required_inputs == 0 || allow_missing {
            self.schedule_node(locked);
        }
    }
}

fn run_scope_root<'scope, 'a: 'scope, 'p: 'a>(
    scope: &rayon::Scope<'scope>,
    next_node: Option<NodeId>,
    pool_nodes: Vec<NodeId>,
    run_state: &'scope RunState<'a, 'p>,
) {
    spawn_pool_tasks(scope, pool_nodes, run_state);
    if let Some(node) = next_node {
        run_pool_task(scope, node, run_state);
    }
}

fn spawn_pool_tasks<'scope, 'a: 'scope, 'p: 'a>(
    scope: &rayon::Scope<'scope>,
    nodes: Vec<NodeId>,
    run_state: &'scope RunState<'a, 'p>,
) {
    for node in nodes {
        scope.spawn(move |scope| run_pool_task(scope, node, run_state));
    }
}

/// Runs `node`, then keeps running the single node it scheduled for itself.
/// Any further scheduled nodes become new pool tasks.
fn run_pool_task<'scope, 'a: 'scope, 'p: 'a>(
    scope: &rayon::Scope<'scope>,
    node: NodeId,
    run_state: &'scope RunState<'a, 'p>,
) {
    let mut next = Some(node);
    while let Some(node) = next {
        let mut task = CurrentTask::default();
        run_state.executor.run_node_task(node, &mut task, run_state);

        spawn_pool_tasks(scope, task.pool_nodes, run_state);
        next = task.next_node;
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        for (node, state) in self.inner.graph.nodes().iter().zip(self.node_states.iter_mut()) {
            let Some(storage) = state.get_mut().storage.take() else {
                continue;
            };
            if let Some(function) = node.function() {
                function.destruct_storage(storage);
            }
        }
    }
}
