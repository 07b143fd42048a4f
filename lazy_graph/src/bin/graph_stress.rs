use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use common::log_setup::setup_logging;
use lazy_graph::elements::basic_funcs::AddFunction;
use lazy_graph::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

const LAYER_COUNT: usize = 64;
const LAYER_WIDTH: usize = 256;
const ROUNDS: usize = 5;

struct LayeredGraph {
    graph: Arc<Graph>,
    input: OutputSocketId,
    outputs: Vec<InputSocketId>,
}

/// Every node adds two random nodes of the layer above. The first layer reads the graph input.
fn layered_graph(rng: &mut StdRng) -> Result<LayeredGraph> {
    let int_type = ValueType::of::<i64>();
    let mut graph = Graph::default();

    let inputs = graph.add_dummy("inputs", &[], &[int_type]);
    let mut previous: Vec<NodeId> = Vec::new();
    for _ in 0..LAYER_COUNT {
        let mut layer = Vec::with_capacity(LAYER_WIDTH);
        for _ in 0..LAYER_WIDTH {
            let node = graph.add_function(AddFunction::new());
            if previous.is_empty() {
                graph.add_link(inputs.output(0), node.input(0))?;
                graph.set_default_value(node.input(1), Box::new(rng.random_range(-10..10i64)))?;
            } else {
                for index in 0..2 {
                    let source = previous[rng.random_range(0..previous.len())];
                    graph.add_link(source.output(0), node.input(index))?;
                }
            }
            layer.push(node);
        }
        previous = layer;
    }

    let output_count = LAYER_WIDTH / 8;
    let outputs = graph.add_dummy("outputs", &vec![int_type; output_count], &[]);
    for index in 0..output_count {
        let source = previous[rng.random_range(0..previous.len())];
        graph.add_link(source.output(0), outputs.input(index))?;
    }
    graph.validate()?;

    Ok(LayeredGraph {
        graph: Arc::new(graph),
        input: inputs.output(0),
        outputs: (0..output_count).map(|index| outputs.input(index)).collect(),
    })
}

fn run(executor: &GraphExecutor, input: i64) -> Vec<Option<i64>> {
    let mut session = GraphSession::new(executor);
    session.supply_input(0, Box::new(input));
    for index in 0..executor.outputs().len() {
        session.request_output(index);
    }
    session.execute();

    (0..executor.outputs().len())
        .map(|index| session.take_output_value::<i64>(index))
        .collect()
}

fn main() -> Result<()> {
    setup_logging("info", "logs", "graph_stress")?;

    let config = match std::env::args().nth(1) {
        Some(path) => ExecutorConfig::from_yaml_file(&path)?,
        None => ExecutorConfig::default(),
    };
    info!("Executor config:\n{}", config.to_yaml());

    let mut rng = StdRng::seed_from_u64(42);
    let mut mismatches = 0;

    for round in 0..ROUNDS {
        let layered = layered_graph(&mut rng)?;
        let input: i64 = rng.random_range(-1000..1000);

        let reference = GraphExecutor::builder(
            Arc::clone(&layered.graph),
            vec![layered.input],
            layered.outputs.clone(),
        )
        .name("reference")
        .config(ExecutorConfig::single_threaded())
        .build()?;
        let candidate = GraphExecutor::builder(
            Arc::clone(&layered.graph),
            vec![layered.input],
            layered.outputs.clone(),
        )
        .name("candidate")
        .config(config.clone())
        .build()?;

        let start = Instant::now();
        let expected = run(&reference, input);
        let single_threaded = start.elapsed();

        let start = Instant::now();
        let actual = run(&candidate, input);
        let configured = start.elapsed();

        if expected != actual {
            mismatches += 1;
            warn!("Round {round}: results differ");
        }
        info!(
            "Round {round}: {} nodes, single-threaded {:?}, configured {:?}",
            layered.graph.node_count(),
            single_threaded,
            configured
        );
    }

    if mismatches > 0 {
        anyhow::bail!("{mismatches} of {ROUNDS} rounds produced different results");
    }
    info!("All {ROUNDS} rounds agree");

    Ok(())
}
