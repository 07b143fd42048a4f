use hashbrown::HashMap;
use parking_lot::MutexGuard;

use crate::common::any_state::AnyState;
use crate::graph::{Node, NodeId, OutputSocketId};
use crate::value::{Value, ValueUsage};

/// ```text
/// NotScheduled ──► Scheduled ──► Running ──► NotScheduled
///                      ▲            │
///                      │            ▼
///                      └── RunningAndRescheduled
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum NodeScheduleState {
    #[default]
    NotScheduled,
    Scheduled,
    Running,
    /// Something changed while the node was running, it has to run again afterwards.
    RunningAndRescheduled,
}

#[derive(Debug)]
pub(crate) struct InputState {
    pub value: Option<Value>,
    pub usage: ValueUsage,
    /// Set once the value is visible to the function body. Never reset.
    pub was_ready_for_execution: bool,
}

#[derive(Debug)]
pub(crate) struct OutputState {
    pub usage: ValueUsage,
    /// Snapshot of `usage` taken when the node starts running.
    pub usage_for_execution: ValueUsage,
    /// Targets that may still need the value. The output becomes unused when it drops to zero.
    pub potential_target_sockets: usize,
    pub has_been_computed: bool,
    /// Index of the graph input this socket stands for, for outputs of boundary nodes.
    pub graph_input_index: Option<usize>,
}

#[derive(Debug, Default)]
pub(crate) struct NodeState {
    pub inputs: Vec<InputState>,
    pub outputs: Vec<OutputState>,

    pub default_inputs_initialized: bool,
    pub always_required_inputs_handled: bool,
    pub storage_initialized: bool,
    pub node_has_finished: bool,
    pub has_side_effects: bool,

    pub missing_required_inputs: usize,
    pub schedule_state: NodeScheduleState,
    /// `None` until first run, while lent to a running body, and after the node finished.
    pub storage: Option<AnyState>,
}

impl NodeState {
    pub fn new(
        node: &Node,
        graph_input_index: &HashMap<OutputSocketId, usize>,
    ) -> NodeState {
        let inputs = node
            .inputs
            .iter()
            .map(|_| InputState {
                value: None,
                usage: ValueUsage::Maybe,
                was_ready_for_execution: false,
            })
            .collect();
        let outputs = node
            .outputs
            .iter()
            .map(|output| OutputState {
                usage: ValueUsage::Maybe,
                usage_for_execution: ValueUsage::Maybe,
                potential_target_sockets: 0,
                has_been_computed: false,
                graph_input_index: graph_input_index.get(&output.id).copied(),
            })
            .collect();

        NodeState {
            inputs,
            outputs,
            ..Default::default()
        }
    }
}

/// Notifications produced while a node is locked. They touch other nodes or the caller,
/// so they are sent only after the lock is released.
#[derive(Debug, Default)]
pub(crate) struct DeferredActions {
    pub required_outputs: Vec<OutputSocketId>,
    pub unused_outputs: Vec<OutputSocketId>,
    pub scheduled_nodes: Vec<NodeId>,
    pub unused_graph_inputs: Vec<usize>,
}

impl DeferredActions {
    pub fn is_empty(&self) -> bool {
        self.required_outputs.is_empty()
            && self.unused_outputs.is_empty()
            && self.scheduled_nodes.is_empty()
            && self.unused_graph_inputs.is_empty()
    }
}

pub(crate) struct LockedNode<'a> {
    pub node: &'a Node,
    pub state: MutexGuard<'a, NodeState>,
    pub deferred: DeferredActions,
}

impl<'a> LockedNode<'a> {
    pub fn new(node: &'a Node, state: MutexGuard<'a, NodeState>) -> Self {
        LockedNode {
            node,
            state,
            deferred: DeferredActions::default(),
        }
    }

    pub fn unlock(self) -> DeferredActions {
        let LockedNode {
            state, deferred, ..
        } = self;
        drop(state);

        deferred
    }
}
