use std::fmt::Write;

use common::{is_debug, BoolExt};
use thiserror::Error;

use crate::function::LazyFunction;
use crate::value::{Value, ValueType};

// === Error Types ===

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Node {0:?} does not exist")]
    NodeNotFound(NodeId),
    #[error("Input {0:?} does not exist")]
    InputNotFound(InputSocketId),
    #[error("Output {0:?} does not exist")]
    OutputNotFound(OutputSocketId),
    #[error("Cannot link {from:?} ({from_type}) to {to:?} ({to_type})")]
    TypeMismatch {
        from: OutputSocketId,
        to: InputSocketId,
        from_type: &'static str,
        to_type: &'static str,
    },
    #[error("Input {to:?} is already linked to {origin:?}")]
    AlreadyLinked {
        to: InputSocketId,
        origin: OutputSocketId,
    },
    #[error("Default value for {input:?} is not a {expected}")]
    DefaultTypeMismatch {
        input: InputSocketId,
        expected: &'static str,
    },
    #[error("Unlinked input {input:?} of node \"{node_name}\" has no default value")]
    MissingDefault {
        input: InputSocketId,
        node_name: String,
    },
}

pub type Result<T> = std::result::Result<T, GraphError>;

// === Identity ===

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }

    pub fn input(self, index: usize) -> InputSocketId {
        InputSocketId { node: self, index }
    }

    pub fn output(self, index: usize) -> OutputSocketId {
        OutputSocketId { node: self, index }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InputSocketId {
    pub node: NodeId,
    pub index: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OutputSocketId {
    pub node: NodeId,
    pub index: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Link {
    pub from: OutputSocketId,
    pub to: InputSocketId,
}

// === Graph Components ===

pub struct InputSocket {
    pub id: InputSocketId,
    pub name: String,
    pub value_type: ValueType,
    pub origin: Option<OutputSocketId>,
    pub default_value: Option<Value>,
}

pub struct OutputSocket {
    pub id: OutputSocketId,
    pub name: String,
    pub value_type: ValueType,
    pub targets: Vec<InputSocketId>,
}

pub enum NodeKind {
    Function(Box<dyn LazyFunction>),
    /// Placeholder at the graph boundary. Its outputs are graph inputs
    /// and its inputs are graph outputs.
    Dummy { name: String },
}

pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub inputs: Vec<InputSocket>,
    pub outputs: Vec<OutputSocket>,
}

impl Node {
    pub fn function(&self) -> Option<&dyn LazyFunction> {
        match &self.kind {
            NodeKind::Function(function) => Some(function.as_ref()),
            NodeKind::Dummy { .. } => None,
        }
    }

    pub fn is_dummy(&self) -> bool {
        matches!(self.kind, NodeKind::Dummy { .. })
    }

    pub fn name(&self) -> &str {
        match &self.kind {
            NodeKind::Function(function) => function.debug_name(),
            NodeKind::Dummy { name } => name,
        }
    }
}

#[derive(Default)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    pub fn add_function<F: LazyFunction + 'static>(&mut self, function: F) -> NodeId {
        self.add_boxed_function(Box::new(function))
    }

    pub fn add_boxed_function(&mut self, function: Box<dyn LazyFunction>) -> NodeId {
        let id = NodeId(self.nodes.len());
        let inputs = function
            .inputs()
            .iter()
            .enumerate()
            .map(|(index, input)| InputSocket {
                id: InputSocketId { node: id, index },
                name: input.debug_name.clone(),
                value_type: input.value_type,
                origin: None,
                default_value: None,
            })
            .collect();
        let outputs = function
            .outputs()
            .iter()
            .enumerate()
            .map(|(index, output)| OutputSocket {
                id: OutputSocketId { node: id, index },
                name: output.debug_name.clone(),
                value_type: output.value_type,
                targets: Vec::new(),
            })
            .collect();

        self.nodes.push(Node {
            id,
            kind: NodeKind::Function(function),
            inputs,
            outputs,
        });

        id
    }

    pub fn add_dummy(
        &mut self,
        name: impl Into<String>,
        input_types: &[ValueType],
        output_types: &[ValueType],
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        let name = name.into();
        let inputs = input_types
            .iter()
            .enumerate()
            .map(|(index, &value_type)| InputSocket {
                id: InputSocketId { node: id, index },
                name: format!("{name}.in{index}"),
                value_type,
                origin: None,
                default_value: None,
            })
            .collect();
        let outputs = output_types
            .iter()
            .enumerate()
            .map(|(index, &value_type)| OutputSocket {
                id: OutputSocketId { node: id, index },
                name: format!("{name}.out{index}"),
                value_type,
                targets: Vec::new(),
            })
            .collect();

        self.nodes.push(Node {
            id,
            kind: NodeKind::Dummy { name },
            inputs,
            outputs,
        });

        id
    }

    pub fn add_link(&mut self, from: OutputSocketId, to: InputSocketId) -> Result<()> {
        let from_type = self.try_output(from)?.value_type;
        let input = self.try_input(to)?;

        if let Some(origin) = input.origin {
            return Err(GraphError::AlreadyLinked { to, origin });
        }
        if input.value_type != from_type {
            return Err(GraphError::TypeMismatch {
                from,
                to,
                from_type: from_type.name(),
                to_type: input.value_type.name(),
            });
        }

        self.nodes[to.node.0].inputs[to.index].origin = Some(from);
        self.nodes[from.node.0].outputs[from.index].targets.push(to);

        Ok(())
    }

    /// Removes the link into `to`, returning its origin.
    /// The input keeps drawing from its default value, the type's default if it had none.
    pub fn remove_link(&mut self, to: InputSocketId) -> Option<OutputSocketId> {
        let input = &mut self.nodes[to.node.0].inputs[to.index];
        let origin = input.origin.take()?;
        let value_type = input.value_type;
        input
            .default_value
            .get_or_insert_with(|| value_type.default_value());

        self.nodes[origin.node.0].outputs[origin.index]
            .targets
            .retain(|target| *target != to);

        Some(origin)
    }

    pub fn set_default_value(&mut self, input: InputSocketId, value: Value) -> Result<()> {
        let socket = self.try_input_mut(input)?;
        if !socket.value_type.matches(&value) {
            return Err(GraphError::DefaultTypeMismatch {
                input,
                expected: socket.value_type.name(),
            });
        }
        socket.default_value = Some(value);

        Ok(())
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn input(&self, id: InputSocketId) -> &InputSocket {
        &self.nodes[id.node.0].inputs[id.index]
    }

    pub fn output(&self, id: OutputSocketId) -> &OutputSocket {
        &self.nodes[id.node.0].outputs[id.index]
    }

    pub fn links(&self) -> impl Iterator<Item = Link> + '_ {
        self.nodes
            .iter()
            .flat_map(|node| node.inputs.iter())
            .filter_map(|input| {
                input.origin.map(|from| Link {
                    from,
                    to: input.id,
                })
            })
    }

    pub fn validate(&self) -> Result<()> {
        self.validate_structure();

        for node in self.nodes.iter().filter(|node| !node.is_dummy()) {
            if let Some(input) = node
                .inputs
                .iter()
                .find(|input| input.origin.is_none() && input.default_value.is_none())
            {
                return Err(GraphError::MissingDefault {
                    input: input.id,
                    node_name: node.name().to_string(),
                });
            }
        }

        Ok(())
    }

    pub fn validate_structure(&self) {
        if !is_debug() {
            return;
        }

        for (index, node) in self.nodes.iter().enumerate() {
            assert_eq!(node.id.0, index);

            if let Some(function) = node.function() {
                assert_eq!(node.inputs.len(), function.inputs().len());
                assert_eq!(node.outputs.len(), function.outputs().len());
            }

            for input in node.inputs.iter() {
                if let Some(origin) = input.origin {
                    let output = self.output(origin);
                    assert_eq!(output.value_type, input.value_type);
                    assert_eq!(
                        output
                            .targets
                            .iter()
                            .filter(|target| **target == input.id)
                            .count(),
                        1
                    );
                }
                if let Some(default_value) = &input.default_value {
                    assert!(input.value_type.matches(default_value));
                }
            }

            for output in node.outputs.iter() {
                for target in output.targets.iter() {
                    assert_eq!(self.input(*target).origin, Some(output.id));
                }
            }
        }
    }

    pub fn to_dot(&self) -> String {
        let mut dot = String::from("digraph {\n  rankdir = LR;\n");

        for node in self.nodes.iter() {
            let shape = node.is_dummy().then_else("ellipse", "box");
            let _ = writeln!(
                dot,
                "  n{} [label=\"{}\", shape={}];",
                node.id.0,
                escape_label(node.name()),
                shape
            );
        }
        for link in self.links() {
            let _ = writeln!(
                dot,
                "  n{} -> n{} [taillabel=\"{}\", headlabel=\"{}\"];",
                link.from.node.0,
                link.to.node.0,
                escape_label(&self.output(link.from).name),
                escape_label(&self.input(link.to).name)
            );
        }

        dot.push_str("}\n");
        dot
    }

    fn try_input(&self, id: InputSocketId) -> Result<&InputSocket> {
        self.nodes
            .get(id.node.0)
            .ok_or(GraphError::NodeNotFound(id.node))?
            .inputs
            .get(id.index)
            .ok_or(GraphError::InputNotFound(id))
    }

    fn try_input_mut(&mut self, id: InputSocketId) -> Result<&mut InputSocket> {
        self.nodes
            .get_mut(id.node.0)
            .ok_or(GraphError::NodeNotFound(id.node))?
            .inputs
            .get_mut(id.index)
            .ok_or(GraphError::InputNotFound(id))
    }

    fn try_output(&self, id: OutputSocketId) -> Result<&OutputSocket> {
        self.nodes
            .get(id.node.0)
            .ok_or(GraphError::NodeNotFound(id.node))?
            .outputs
            .get(id.index)
            .ok_or(GraphError::OutputNotFound(id))
    }
}

fn escape_label(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"")
}
