use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use common::log_setup::setup_test_logging;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::*;
use crate::elements::basic_funcs::{AddFunction, ConstantFunction, MultiplyFunction};
use crate::session::GraphSession;
use crate::value::ValueType;

// === Test Functions ===

/// Adds two integers, counting invocations and optionally sleeping a random time.
struct CountingAdd {
    inputs: Vec<FuncInput>,
    outputs: Vec<FuncOutput>,
    calls: Arc<AtomicUsize>,
    max_delay_us: u64,
    threads: Option<Arc<Mutex<Vec<ThreadId>>>>,
}

impl CountingAdd {
    fn new(calls: Arc<AtomicUsize>) -> Self {
        let int_type = ValueType::of::<i64>();
        CountingAdd {
            inputs: vec![
                FuncInput::new("a", int_type, ValueUsage::Used),
                FuncInput::new("b", int_type, ValueUsage::Used),
            ],
            outputs: vec![FuncOutput::new("sum", int_type)],
            calls,
            max_delay_us: 0,
            threads: None,
        }
    }

    fn with_delay(mut self, max_delay_us: u64) -> Self {
        self.max_delay_us = max_delay_us;
        self
    }

    fn with_thread_log(mut self, threads: Arc<Mutex<Vec<ThreadId>>>) -> Self {
        self.threads = Some(threads);
        self
    }
}

impl LazyFunction for CountingAdd {
    fn debug_name(&self) -> &str {
        "counting_add"
    }

    fn inputs(&self) -> &[FuncInput] {
        &self.inputs
    }

    fn outputs(&self) -> &[FuncOutput] {
        &self.outputs
    }

    fn execute(&self, params: &mut dyn Params, _context: &mut Context<'_>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(threads) = &self.threads {
            threads.lock().push(thread::current().id());
        }
        if self.max_delay_us > 0 {
            let delay = rand::rng().random_range(0..=self.max_delay_us);
            thread::sleep(Duration::from_micros(delay));
        }

        let a = *params.get_input::<i64>(0).unwrap();
        let b = *params.get_input::<i64>(1).unwrap();
        params.set_output_value(0, a.wrapping_add(b));
    }
}

/// Computes `a * 2` from `a` and `b * 5` from `b`, each as soon as its input is there.
/// `b` is only requested when the second output is needed.
struct PartialScale {
    inputs: Vec<FuncInput>,
    outputs: Vec<FuncOutput>,
    destructs: Arc<AtomicUsize>,
}

impl PartialScale {
    fn new(destructs: Arc<AtomicUsize>) -> Self {
        let int_type = ValueType::of::<i64>();
        PartialScale {
            inputs: vec![
                FuncInput::new("a", int_type, ValueUsage::Used),
                FuncInput::new("b", int_type, ValueUsage::Maybe),
            ],
            outputs: vec![
                FuncOutput::new("a2", int_type),
                FuncOutput::new("b5", int_type),
            ],
            destructs,
        }
    }
}

impl LazyFunction for PartialScale {
    fn debug_name(&self) -> &str {
        "partial_scale"
    }

    fn inputs(&self) -> &[FuncInput] {
        &self.inputs
    }

    fn outputs(&self) -> &[FuncOutput] {
        &self.outputs
    }

    fn allow_missing_requested_inputs(&self) -> bool {
        true
    }

    fn init_storage(&self) -> AnyState {
        AnyState::new(0usize)
    }

    fn destruct_storage(&self, storage: AnyState) {
        assert!(storage.is::<usize>());
        self.destructs.fetch_add(1, Ordering::SeqCst);
    }

    fn execute(&self, params: &mut dyn Params, context: &mut Context<'_>) {
        *context.storage.get_or_default::<usize>() += 1;

        if !params.output_was_set(0) && params.get_output_usage(0) != ValueUsage::Unused {
            if let Some(a) = params.get_input::<i64>(0).copied() {
                params.set_output_value(0, a * 2);
            }
        }
        if !params.output_was_set(1) && params.get_output_usage(1) != ValueUsage::Unused {
            if let Some(b) = params.get_input_or_request::<i64>(1).copied() {
                params.set_output_value(1, b * 5);
            }
        }
    }
}

/// Side-effect sink without outputs.
struct Store {
    inputs: Vec<FuncInput>,
    sink: Arc<Mutex<Vec<i64>>>,
}

impl Store {
    fn new(sink: Arc<Mutex<Vec<i64>>>) -> Self {
        Store {
            inputs: vec![FuncInput::new(
                "value",
                ValueType::of::<i64>(),
                ValueUsage::Used,
            )],
            sink,
        }
    }
}

impl LazyFunction for Store {
    fn debug_name(&self) -> &str {
        "store"
    }

    fn inputs(&self) -> &[FuncInput] {
        &self.inputs
    }

    fn outputs(&self) -> &[FuncOutput] {
        &[]
    }

    fn execute(&self, params: &mut dyn Params, _context: &mut Context<'_>) {
        let value = params.extract_input::<i64>(0).unwrap();
        self.sink.lock().push(value);
    }
}

static LIVE_TRACKED: AtomicI64 = AtomicI64::new(0);

/// Counts live instances, so leaked or doubly created values show up.
#[derive(Debug)]
struct Tracked(i64);

impl Tracked {
    fn new(value: i64) -> Self {
        LIVE_TRACKED.fetch_add(1, Ordering::SeqCst);
        Tracked(value)
    }
}

impl Clone for Tracked {
    fn clone(&self) -> Self {
        Tracked::new(self.0)
    }
}

impl Default for Tracked {
    fn default() -> Self {
        Tracked::new(0)
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        LIVE_TRACKED.fetch_sub(1, Ordering::SeqCst);
    }
}

struct IncrementTracked {
    inputs: Vec<FuncInput>,
    outputs: Vec<FuncOutput>,
}

impl IncrementTracked {
    fn new() -> Self {
        let tracked_type = ValueType::of::<Tracked>();
        IncrementTracked {
            inputs: vec![FuncInput::new("in", tracked_type, ValueUsage::Used)],
            outputs: vec![FuncOutput::new("out", tracked_type)],
        }
    }
}

impl LazyFunction for IncrementTracked {
    fn debug_name(&self) -> &str {
        "increment_tracked"
    }

    fn inputs(&self) -> &[FuncInput] {
        &self.inputs
    }

    fn outputs(&self) -> &[FuncOutput] {
        &self.outputs
    }

    fn execute(&self, params: &mut dyn Params, _context: &mut Context<'_>) {
        let value = params.extract_input::<Tracked>(0).unwrap();
        params.set_output_value(0, Tracked::new(value.0 + 1));
    }
}

#[derive(Default)]
struct RecordingLogger {
    before: AtomicUsize,
    after: AtomicUsize,
    values: Mutex<Vec<String>>,
}

impl ExecutorLogger for RecordingLogger {
    fn log_socket_value(
        &self,
        socket: &crate::graph::OutputSocket,
        value: &Value,
        _user_data: UserData<'_>,
    ) {
        self.values
            .lock()
            .push(socket.value_type.format_value(value));
    }

    fn log_before_node_execute(&self, _node: &Node, _user_data: UserData<'_>) {
        self.before.fetch_add(1, Ordering::SeqCst);
    }

    fn log_after_node_execute(&self, _node: &Node, _user_data: UserData<'_>) {
        self.after.fetch_add(1, Ordering::SeqCst);
    }
}

// === Test Graphs ===

struct AddChain {
    graph: Arc<Graph>,
    input: OutputSocketId,
    output: InputSocketId,
    first: NodeId,
    second: NodeId,
}

/// `first = input + 2`, `second = 5 + first`, output `second`.
fn add_chain() -> anyhow::Result<AddChain> {
    let int_type = ValueType::of::<i64>();
    let mut graph = Graph::default();

    let inputs = graph.add_dummy("inputs", &[], &[int_type]);
    let first = graph.add_function(AddFunction::new());
    let second = graph.add_function(AddFunction::new());
    let outputs = graph.add_dummy("outputs", &[int_type], &[]);

    graph.set_default_value(first.input(1), Box::new(2i64))?;
    graph.set_default_value(second.input(0), Box::new(5i64))?;
    graph.add_link(inputs.output(0), first.input(0))?;
    graph.add_link(first.output(0), second.input(1))?;
    graph.add_link(second.output(0), outputs.input(0))?;
    graph.validate()?;

    Ok(AddChain {
        graph: Arc::new(graph),
        input: inputs.output(0),
        output: outputs.input(0),
        first,
        second,
    })
}

fn add_chain_executor(config: ExecutorConfig) -> anyhow::Result<GraphExecutor> {
    let chain = add_chain()?;
    Ok(GraphExecutor::builder(chain.graph, vec![chain.input], vec![chain.output])
        .config(config)
        .build()?)
}

struct RandomGraph {
    graph: Arc<Graph>,
    input: OutputSocketId,
    outputs: Vec<InputSocketId>,
    expected: Vec<i64>,
    calls: Vec<Arc<AtomicUsize>>,
    /// Nodes some requested output depends on.
    needed: Vec<bool>,
}

const RANDOM_GRAPH_INPUT: i64 = 3;

fn random_graph(
    seed: u64,
    node_count: usize,
    output_count: usize,
    max_delay_us: u64,
) -> anyhow::Result<RandomGraph> {
    let int_type = ValueType::of::<i64>();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut graph = Graph::default();

    let input_node = graph.add_dummy("inputs", &[], &[int_type]);
    let mut nodes: Vec<NodeId> = Vec::with_capacity(node_count);
    let mut values: Vec<i64> = Vec::with_capacity(node_count);
    let mut sources: Vec<Vec<usize>> = Vec::with_capacity(node_count);
    let mut calls = Vec::with_capacity(node_count);

    for _ in 0..node_count {
        let counter = Arc::new(AtomicUsize::new(0));
        let node =
            graph.add_function(CountingAdd::new(Arc::clone(&counter)).with_delay(max_delay_us));
        calls.push(counter);

        let mut operands = [0i64; 2];
        let mut node_sources = Vec::new();
        for (index, operand) in operands.iter_mut().enumerate() {
            match rng.random_range(0..4) {
                0 | 1 if !nodes.is_empty() => {
                    let source = rng.random_range(0..nodes.len());
                    graph.add_link(nodes[source].output(0), node.input(index))?;
                    *operand = values[source];
                    node_sources.push(source);
                }
                2 => {
                    graph.add_link(input_node.output(0), node.input(index))?;
                    *operand = RANDOM_GRAPH_INPUT;
                }
                _ => {
                    let constant: i64 = rng.random_range(-100..100);
                    graph.set_default_value(node.input(index), Box::new(constant))?;
                    *operand = constant;
                }
            }
        }

        nodes.push(node);
        values.push(operands[0].wrapping_add(operands[1]));
        sources.push(node_sources);
    }

    let output_node = graph.add_dummy("outputs", &vec![int_type; output_count], &[]);
    let mut expected = Vec::with_capacity(output_count);
    let mut needed = vec![false; node_count];
    let mut stack = Vec::new();
    for index in 0..output_count {
        let source = rng.random_range(node_count / 2..node_count);
        graph.add_link(nodes[source].output(0), output_node.input(index))?;
        expected.push(values[source]);
        stack.push(source);
    }
    while let Some(node) = stack.pop() {
        if std::mem::replace(&mut needed[node], true) {
            continue;
        }
        stack.extend(sources[node].iter().copied());
    }

    graph.validate()?;

    Ok(RandomGraph {
        graph: Arc::new(graph),
        input: input_node.output(0),
        outputs: (0..output_count).map(|index| output_node.input(index)).collect(),
        expected,
        calls,
        needed,
    })
}

/// Supplies the input up front, requests every output and runs once.
fn evaluate_all(executor: &GraphExecutor, input: i64) -> Vec<Option<i64>> {
    let output_count = executor.outputs().len();
    let mut session = GraphSession::new(executor);

    if !executor.inputs().is_empty() {
        session.supply_input(0, Box::new(input));
    }
    for index in 0..output_count {
        session.request_output(index);
    }
    session.execute();

    (0..output_count)
        .map(|index| session.take_output_value::<i64>(index))
        .collect()
}

// === Tests ===

#[test]
fn add_chain_end_to_end() -> anyhow::Result<()> {
    setup_test_logging();

    for config in [ExecutorConfig::default(), ExecutorConfig::single_threaded()] {
        let executor = add_chain_executor(config)?;
        let mut session = GraphSession::new(&executor);

        session.request_output(0);
        session.execute();
        assert_eq!(session.input_usage(0), ValueUsage::Used);
        assert!(!session.output_is_set(0));

        session.supply_input(0, Box::new(10i64));
        session.execute();
        assert_eq!(session.take_output_value::<i64>(0), Some(17));
    }

    Ok(())
}

#[test]
fn nothing_requested_runs_nothing() -> anyhow::Result<()> {
    let int_type = ValueType::of::<i64>();
    let first_calls = Arc::new(AtomicUsize::new(0));
    let second_calls = Arc::new(AtomicUsize::new(0));

    let mut graph = Graph::default();
    let inputs = graph.add_dummy("inputs", &[], &[int_type]);
    let first = graph.add_function(CountingAdd::new(Arc::clone(&first_calls)));
    let second = graph.add_function(CountingAdd::new(Arc::clone(&second_calls)));
    let outputs = graph.add_dummy("outputs", &[int_type], &[]);
    graph.add_link(inputs.output(0), first.input(0))?;
    graph.add_link(inputs.output(0), first.input(1))?;
    graph.add_link(first.output(0), second.input(0))?;
    graph.add_link(first.output(0), second.input(1))?;
    graph.add_link(second.output(0), outputs.input(0))?;

    let executor =
        GraphExecutor::builder(Arc::new(graph), vec![inputs.output(0)], vec![outputs.input(0)])
            .build()?;
    let mut session = GraphSession::new(&executor);
    session.supply_input(0, Box::new(1i64));
    session.execute();
    session.execute();

    assert_eq!(first_calls.load(Ordering::SeqCst), 0);
    assert_eq!(second_calls.load(Ordering::SeqCst), 0);
    assert!(!session.output_is_set(0));

    // requesting later computes each node once
    session.request_output(0);
    session.execute();
    session.execute();

    assert_eq!(session.take_output_value::<i64>(0), Some(4));
    assert_eq!(first_calls.load(Ordering::SeqCst), 1);
    assert_eq!(second_calls.load(Ordering::SeqCst), 1);

    Ok(())
}

#[test]
fn discarded_output_releases_input() -> anyhow::Result<()> {
    let executor = add_chain_executor(ExecutorConfig::default())?;
    let mut session = GraphSession::new(&executor);

    session.discard_output(0);
    session.execute();

    assert_eq!(session.input_usage(0), ValueUsage::Unused);
    assert!(!session.output_is_set(0));

    Ok(())
}

#[test]
fn supplying_unused_input_is_ignored() -> anyhow::Result<()> {
    let executor = add_chain_executor(ExecutorConfig::default())?;
    let mut session = GraphSession::new(&executor);

    session.discard_output(0);
    session.execute();
    assert_eq!(session.input_usage(0), ValueUsage::Unused);

    session.supply_input(0, Box::new(1i64));
    session.execute();

    assert_eq!(session.input_usage(0), ValueUsage::Unused);
    assert!(!session.output_is_set(0));

    Ok(())
}

#[test]
fn unlinked_output_gets_default() -> anyhow::Result<()> {
    let int_type = ValueType::of::<i64>();
    let mut graph = Graph::default();
    let inputs = graph.add_dummy("inputs", &[], &[int_type]);
    let outputs = graph.add_dummy("outputs", &[int_type, int_type], &[]);
    graph.add_link(inputs.output(0), outputs.input(0))?;
    graph.set_default_value(outputs.input(1), Box::new(42i64))?;

    let executor = GraphExecutor::builder(
        Arc::new(graph),
        vec![inputs.output(0)],
        vec![outputs.input(0), outputs.input(1)],
    )
    .build()?;

    let mut session = GraphSession::new(&executor);
    session.execute();
    assert_eq!(session.take_output_value::<i64>(1), Some(42));
    assert!(!session.output_is_set(0));

    // passthrough from graph input to graph output
    session.request_output(0);
    session.execute();
    assert_eq!(session.input_usage(0), ValueUsage::Used);
    session.supply_input(0, Box::new(8i64));
    session.execute();
    assert_eq!(session.take_output_value::<i64>(0), Some(8));

    Ok(())
}

#[test]
fn requesting_one_output_evaluates_only_its_dependencies() -> anyhow::Result<()> {
    let int_type = ValueType::of::<i64>();
    let left_calls = Arc::new(AtomicUsize::new(0));
    let right_calls = Arc::new(AtomicUsize::new(0));

    let mut graph = Graph::default();
    let left = graph.add_function(CountingAdd::new(Arc::clone(&left_calls)));
    let right = graph.add_function(CountingAdd::new(Arc::clone(&right_calls)));
    let outputs = graph.add_dummy("outputs", &[int_type, int_type], &[]);
    for node in [left, right] {
        graph.set_default_value(node.input(0), Box::new(1i64))?;
        graph.set_default_value(node.input(1), Box::new(2i64))?;
    }
    graph.add_link(left.output(0), outputs.input(0))?;
    graph.add_link(right.output(0), outputs.input(1))?;

    let executor = GraphExecutor::builder(
        Arc::new(graph),
        Vec::new(),
        vec![outputs.input(0), outputs.input(1)],
    )
    .build()?;
    let mut session = GraphSession::new(&executor);
    session.request_output(1);
    session.execute();

    assert_eq!(session.take_output_value::<i64>(1), Some(3));
    assert!(!session.output_is_set(0));
    assert_eq!(left_calls.load(Ordering::SeqCst), 0);
    assert_eq!(right_calls.load(Ordering::SeqCst), 1);

    Ok(())
}

#[test]
fn shared_dependency_runs_once() -> anyhow::Result<()> {
    let int_type = ValueType::of::<i64>();

    for _ in 0..20 {
        let calls: Vec<Arc<AtomicUsize>> = (0..4).map(|_| Arc::new(AtomicUsize::new(0))).collect();

        // diamond: top feeds left and right, both feed bottom
        let mut graph = Graph::default();
        let top = graph.add_function(CountingAdd::new(Arc::clone(&calls[0])).with_delay(100));
        let left = graph.add_function(CountingAdd::new(Arc::clone(&calls[1])).with_delay(100));
        let right = graph.add_function(CountingAdd::new(Arc::clone(&calls[2])).with_delay(100));
        let bottom = graph.add_function(CountingAdd::new(Arc::clone(&calls[3])));
        let outputs = graph.add_dummy("outputs", &[int_type, int_type], &[]);

        graph.set_default_value(top.input(0), Box::new(1i64))?;
        graph.set_default_value(top.input(1), Box::new(1i64))?;
        graph.add_link(top.output(0), left.input(0))?;
        graph.add_link(top.output(0), left.input(1))?;
        graph.add_link(top.output(0), right.input(0))?;
        graph.set_default_value(right.input(1), Box::new(10i64))?;
        graph.add_link(left.output(0), bottom.input(0))?;
        graph.add_link(right.output(0), bottom.input(1))?;
        graph.add_link(bottom.output(0), outputs.input(0))?;
        graph.add_link(top.output(0), outputs.input(1))?;

        let executor = GraphExecutor::builder(
            Arc::new(graph),
            Vec::new(),
            vec![outputs.input(0), outputs.input(1)],
        )
        .build()?;
        let mut session = GraphSession::new(&executor);
        session.request_output(0);
        session.request_output(1);
        session.execute();

        assert_eq!(session.take_output_value::<i64>(0), Some(4 + 12));
        assert_eq!(session.take_output_value::<i64>(1), Some(2));
        for counter in calls.iter() {
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        }
    }

    Ok(())
}

#[test]
fn values_are_consumed_exactly_once() -> anyhow::Result<()> {
    {
        let tracked_type = ValueType::of::<Tracked>();
        let mut graph = Graph::default();
        let source = graph.add_function(ConstantFunction::new(Tracked::new(7)));
        let used = graph.add_function(IncrementTracked::new());
        let discarded = graph.add_function(IncrementTracked::new());
        let unreachable = graph.add_function(IncrementTracked::new());
        let outputs = graph.add_dummy("outputs", &[tracked_type, tracked_type], &[]);

        graph.add_link(source.output(0), used.input(0))?;
        graph.add_link(source.output(0), discarded.input(0))?;
        graph.add_link(source.output(0), unreachable.input(0))?;
        graph.add_link(used.output(0), outputs.input(0))?;
        graph.add_link(discarded.output(0), outputs.input(1))?;

        let executor = GraphExecutor::builder(
            Arc::new(graph),
            Vec::new(),
            vec![outputs.input(0), outputs.input(1)],
        )
        .build()?;

        let mut session = GraphSession::new(&executor);
        session.request_output(0);
        session.discard_output(1);
        session.execute();

        let output = session.take_output_value::<Tracked>(0).unwrap();
        assert_eq!(output.0, 8);
        assert!(!session.output_is_set(1));
    }

    assert_eq!(LIVE_TRACKED.load(Ordering::SeqCst), 0);

    Ok(())
}

#[test]
fn cycle_without_data_dependency() -> anyhow::Result<()> {
    let int_type = ValueType::of::<i64>();
    let destructs = Arc::new(AtomicUsize::new(0));

    let mut graph = Graph::default();
    let inputs = graph.add_dummy("inputs", &[], &[int_type]);
    let scale = graph.add_function(PartialScale::new(Arc::clone(&destructs)));
    let outputs = graph.add_dummy("outputs", &[int_type], &[]);
    graph.add_link(inputs.output(0), scale.input(0))?;
    graph.add_link(scale.output(0), scale.input(1))?;
    graph.add_link(scale.output(1), outputs.input(0))?;
    assert!(graph.find_cycle().is_some());

    let executor =
        GraphExecutor::builder(Arc::new(graph), vec![inputs.output(0)], vec![outputs.input(0)])
            .build()?;
    let mut session = GraphSession::new(&executor);

    session.request_output(0);
    session.execute();
    assert_eq!(session.input_usage(0), ValueUsage::Used);
    assert_eq!(destructs.load(Ordering::SeqCst), 0);

    session.supply_input(0, Box::new(10i64));
    session.execute();
    assert_eq!(session.take_output_value::<i64>(0), Some(100));
    assert_eq!(destructs.load(Ordering::SeqCst), 1);

    Ok(())
}

#[test]
fn abandoned_execution_releases_storage() -> anyhow::Result<()> {
    let int_type = ValueType::of::<i64>();
    let destructs = Arc::new(AtomicUsize::new(0));

    let mut graph = Graph::default();
    let inputs = graph.add_dummy("inputs", &[], &[int_type, int_type]);
    let scale = graph.add_function(PartialScale::new(Arc::clone(&destructs)));
    let outputs = graph.add_dummy("outputs", &[int_type, int_type], &[]);
    graph.add_link(inputs.output(0), scale.input(0))?;
    graph.add_link(inputs.output(1), scale.input(1))?;
    graph.add_link(scale.output(0), outputs.input(0))?;
    graph.add_link(scale.output(1), outputs.input(1))?;

    let executor = GraphExecutor::builder(
        Arc::new(graph),
        vec![inputs.output(0), inputs.output(1)],
        vec![outputs.input(0), outputs.input(1)],
    )
    .config(ExecutorConfig::single_threaded())
    .build()?;

    {
        let mut session = GraphSession::new(&executor);
        session.request_output(0);
        session.request_output(1);
        session.supply_input(0, Box::new(4i64));
        session.execute();

        assert_eq!(session.take_output_value::<i64>(0), Some(8));
        assert_eq!(session.input_usage(1), ValueUsage::Used);
        assert_eq!(destructs.load(Ordering::SeqCst), 0);
    }

    assert_eq!(destructs.load(Ordering::SeqCst), 1);

    Ok(())
}

#[test]
fn side_effect_nodes_run_without_outputs() -> anyhow::Result<()> {
    let int_type = ValueType::of::<i64>();
    let sink = Arc::new(Mutex::new(Vec::new()));

    let mut graph = Graph::default();
    let inputs = graph.add_dummy("inputs", &[], &[int_type]);
    let plus_ten = graph.add_function(AddFunction::new());
    let plus_ninety = graph.add_function(AddFunction::new());
    let first_store = graph.add_function(Store::new(Arc::clone(&sink)));
    let second_store = graph.add_function(Store::new(Arc::clone(&sink)));
    let idle_store = graph.add_function(Store::new(Arc::clone(&sink)));

    graph.add_link(inputs.output(0), plus_ten.input(0))?;
    graph.set_default_value(plus_ten.input(1), Box::new(10i64))?;
    graph.add_link(plus_ten.output(0), plus_ninety.input(0))?;
    graph.set_default_value(plus_ninety.input(1), Box::new(90i64))?;
    graph.add_link(plus_ten.output(0), first_store.input(0))?;
    graph.add_link(plus_ninety.output(0), second_store.input(0))?;
    graph.add_link(plus_ninety.output(0), idle_store.input(0))?;

    let executor = GraphExecutor::builder(Arc::new(graph), vec![inputs.output(0)], Vec::new())
        .side_effect_provider(Arc::new(vec![first_store, second_store]))
        .build()?;

    let mut session = GraphSession::new(&executor);
    session.execute();
    assert_eq!(session.input_usage(0), ValueUsage::Used);
    assert!(sink.lock().is_empty());

    session.supply_input(0, Box::new(5i64));
    session.execute();

    let mut stored = sink.lock().clone();
    stored.sort();
    assert_eq!(stored, vec![15, 105]);

    Ok(())
}

#[test]
fn nested_graph() -> anyhow::Result<()> {
    let int_type = ValueType::of::<i64>();
    let inner = add_chain_executor(ExecutorConfig::default())?;

    let mut graph = Graph::default();
    let inputs = graph.add_dummy("inputs", &[], &[int_type]);
    let nested = graph.add_function(inner);
    let multiply = graph.add_function(MultiplyFunction::new());
    let outputs = graph.add_dummy("outputs", &[int_type], &[]);
    graph.add_link(inputs.output(0), nested.input(0))?;
    graph.add_link(nested.output(0), multiply.input(0))?;
    graph.set_default_value(multiply.input(1), Box::new(3i64))?;
    graph.add_link(multiply.output(0), outputs.input(0))?;

    let executor =
        GraphExecutor::builder(Arc::new(graph), vec![inputs.output(0)], vec![outputs.input(0)])
            .name("outer")
            .build()?;
    let mut session = GraphSession::new(&executor);

    session.request_output(0);
    session.execute();
    assert_eq!(session.input_usage(0), ValueUsage::Used);

    session.supply_input(0, Box::new(10i64));
    session.execute();
    assert_eq!(session.take_output_value::<i64>(0), Some(51));

    Ok(())
}

#[test]
fn logger_sees_values_and_executions() -> anyhow::Result<()> {
    let chain = add_chain()?;
    let logger = Arc::new(RecordingLogger::default());

    let executor = GraphExecutor::builder(chain.graph, vec![chain.input], vec![chain.output])
        .logger(Arc::clone(&logger) as Arc<dyn ExecutorLogger>)
        .build()?;

    assert_eq!(evaluate_all(&executor, 10), vec![Some(17)]);
    assert_eq!(logger.before.load(Ordering::SeqCst), 2);
    assert_eq!(logger.after.load(Ordering::SeqCst), 2);

    let mut values = logger.values.lock().clone();
    values.sort();
    assert_eq!(values, vec!["10", "12", "17"]);

    Ok(())
}

#[test]
fn tracing_logger_smoke() -> anyhow::Result<()> {
    setup_test_logging();
    let chain = add_chain()?;
    assert_eq!(chain.first.index() + 1, chain.second.index());

    let executor = GraphExecutor::builder(chain.graph, vec![chain.input], vec![chain.output])
        .logger(Arc::new(TracingLogger))
        .build()?;

    assert_eq!(evaluate_all(&executor, -3), vec![Some(4)]);

    Ok(())
}

#[test]
fn single_threaded_stays_on_caller_thread() -> anyhow::Result<()> {
    let int_type = ValueType::of::<i64>();
    let threads = Arc::new(Mutex::new(Vec::new()));

    let mut graph = Graph::default();
    let outputs = graph.add_dummy("outputs", &vec![int_type; 8], &[]);
    for index in 0..8 {
        let node = graph.add_function(
            CountingAdd::new(Arc::new(AtomicUsize::new(0))).with_thread_log(Arc::clone(&threads)),
        );
        graph.set_default_value(node.input(0), Box::new(index as i64))?;
        graph.set_default_value(node.input(1), Box::new(1i64))?;
        graph.add_link(node.output(0), outputs.input(index))?;
    }

    let executor = GraphExecutor::builder(
        Arc::new(graph),
        Vec::new(),
        (0..8).map(|index| outputs.input(index)).collect(),
    )
    .config(ExecutorConfig::single_threaded())
    .build()?;

    let results = evaluate_all(&executor, 0);
    assert_eq!(results, (1..=8).map(Some).collect::<Vec<Option<i64>>>());

    let threads = threads.lock();
    assert_eq!(threads.len(), 8);
    assert!(threads.iter().all(|id| *id == thread::current().id()));

    Ok(())
}

#[test]
fn caller_thread_runs_one_node_next_to_the_pool() -> anyhow::Result<()> {
    let int_type = ValueType::of::<i64>();
    let threads = Arc::new(Mutex::new(Vec::new()));

    let mut graph = Graph::default();
    let outputs = graph.add_dummy("outputs", &vec![int_type; 8], &[]);
    for index in 0..8 {
        let node = graph.add_function(
            CountingAdd::new(Arc::new(AtomicUsize::new(0)))
                .with_delay(200)
                .with_thread_log(Arc::clone(&threads)),
        );
        graph.set_default_value(node.input(0), Box::new(index as i64))?;
        graph.set_default_value(node.input(1), Box::new(1i64))?;
        graph.add_link(node.output(0), outputs.input(index))?;
    }

    let executor = GraphExecutor::builder(
        Arc::new(graph),
        Vec::new(),
        (0..8).map(|index| outputs.input(index)).collect(),
    )
    .config(ExecutorConfig {
        thread_count: Some(2),
        ..Default::default()
    })
    .build()?;
    assert_eq!(executor.config().thread_count, Some(2));
    assert_eq!(executor.graph().node_count(), 9);

    let results = evaluate_all(&executor, 0);
    assert_eq!(results, (1..=8).map(Some).collect::<Vec<Option<i64>>>());

    let threads = threads.lock();
    assert_eq!(threads.len(), 8);
    assert!(threads.contains(&thread::current().id()));

    Ok(())
}

#[test]
fn concurrent_results_are_deterministic() -> anyhow::Result<()> {
    setup_test_logging();

    for seed in 0..5u64 {
        let random = random_graph(seed, 40, 4, 200)?;
        let configs = [
            ExecutorConfig::single_threaded(),
            ExecutorConfig::default(),
            ExecutorConfig {
                thread_count: Some(3),
                ..Default::default()
            },
        ];

        for config in configs {
            for _ in 0..3 {
                let executor = GraphExecutor::builder(
                    Arc::clone(&random.graph),
                    vec![random.input],
                    random.outputs.clone(),
                )
                .config(config.clone())
                .build()?;

                let results = evaluate_all(&executor, RANDOM_GRAPH_INPUT);
                let expected: Vec<Option<i64>> = random.expected.iter().copied().map(Some).collect();
                assert_eq!(results, expected, "seed {seed}, config {config:?}");
            }
        }
    }

    Ok(())
}

#[test]
fn stress_random_graphs() -> anyhow::Result<()> {
    setup_test_logging();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for seed in 0..30u64 {
        let node_count = rng.random_range(20..400);
        let output_count = rng.random_range(1..8);
        let random = random_graph(seed, node_count, output_count, 0)?;

        let config = ExecutorConfig {
            thread_count: Some(rng.random_range(1..8)),
            parallel_state_init_threshold: rng.random_range(0..2) * node_count,
            ..Default::default()
        };
        let executor = GraphExecutor::builder(
            Arc::clone(&random.graph),
            vec![random.input],
            random.outputs.clone(),
        )
        .config(config)
        .build()?;

        let results = evaluate_all(&executor, RANDOM_GRAPH_INPUT);
        let expected: Vec<Option<i64>> = random.expected.iter().copied().map(Some).collect();
        assert_eq!(results, expected, "seed {seed}");

        for (index, counter) in random.calls.iter().enumerate() {
            let calls = counter.load(Ordering::SeqCst);
            assert_eq!(
                calls,
                usize::from(random.needed[index]),
                "seed {seed}, node {index}"
            );
        }
    }

    Ok(())
}

#[test]
fn eager_execution_of_a_graph() -> anyhow::Result<()> {
    let executor = add_chain_executor(ExecutorConfig::default())?;

    let outputs = crate::basic_params::execute_eagerly(
        &executor,
        vec![Box::new(1i64) as Value],
        None,
    );

    assert_eq!(outputs[0].downcast_ref::<i64>(), Some(&8));

    Ok(())
}
