use std::any::Any;

use tracing::{error, trace};

use crate::graph::{Graph, InputSocketId, Node, NodeId, OutputSocket};
use crate::value::Value;

pub type UserData<'a> = Option<&'a (dyn Any + Send + Sync)>;

/// Observes an execution. All methods may be called from several threads at once.
pub trait ExecutorLogger: Send + Sync {
    fn log_socket_value(&self, _socket: &OutputSocket, _value: &Value, _user_data: UserData<'_>) {}

    fn log_before_node_execute(&self, _node: &Node, _user_data: UserData<'_>) {}

    fn log_after_node_execute(&self, _node: &Node, _user_data: UserData<'_>) {}

    fn dump_when_outputs_are_missing(
        &self,
        _node: &Node,
        _missing_outputs: &[usize],
        _user_data: UserData<'_>,
    ) {
    }

    fn dump_when_input_is_set_twice(
        &self,
        _graph: &Graph,
        _target: InputSocketId,
        _user_data: UserData<'_>,
    ) {
    }
}

/// Picks nodes that have to run even if none of their outputs is used.
pub trait SideEffectProvider: Send + Sync {
    fn nodes_with_side_effects(&self, user_data: UserData<'_>) -> Vec<NodeId>;
}

impl SideEffectProvider for Vec<NodeId> {
    fn nodes_with_side_effects(&self, _user_data: UserData<'_>) -> Vec<NodeId> {
        self.clone()
    }
}

/// Writes values and node executions at trace level, invariant dumps as errors.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl ExecutorLogger for TracingLogger {
    fn log_socket_value(&self, socket: &OutputSocket, value: &Value, _user_data: UserData<'_>) {
        trace!(
            "{} = {}",
            socket.name,
            socket.value_type.format_value(value)
        );
    }

    fn log_before_node_execute(&self, node: &Node, _user_data: UserData<'_>) {
        trace!("Executing {} ({:?})", node.name(), node.id);
    }

    fn log_after_node_execute(&self, node: &Node, _user_data: UserData<'_>) {
        trace!("Executed {} ({:?})", node.name(), node.id);
    }

    fn dump_when_outputs_are_missing(
        &self,
        node: &Node,
        missing_outputs: &[usize],
        _user_data: UserData<'_>,
    ) {
        let names: Vec<&str> = missing_outputs
            .iter()
            .map(|&index| node.outputs[index].name.as_str())
            .collect();
        error!(
            "Node {} did not compute required outputs {:?}",
            node.name(),
            names
        );
    }

    fn dump_when_input_is_set_twice(
        &self,
        graph: &Graph,
        target: InputSocketId,
        _user_data: UserData<'_>,
    ) {
        let node = graph.node(target.node);
        let origin = graph
            .input(target)
            .origin
            .map(|origin| graph.output(origin).name.as_str());
        error!(
            "Input {} of node {} received a second value (origin {:?})",
            node.inputs[target.index].name,
            node.name(),
            origin
        );
    }
}
