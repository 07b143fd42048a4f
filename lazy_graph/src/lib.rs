pub mod basic_params;
pub mod common;
pub mod config;
pub mod cycles;
pub mod elements;
pub mod function;
pub mod graph;
pub mod graph_executor;
pub mod session;
pub mod value;

pub mod prelude {
    pub use crate::basic_params::{execute_eagerly, BasicParams};
    pub use crate::common::any_state::AnyState;
    pub use crate::config::ExecutorConfig;
    pub use crate::cycles::{CutClosingLink, CutLinkIntoNode, CycleBreakPolicy};
    pub use crate::function::{Context, FuncInput, FuncOutput, LazyFunction, Params};
    pub use crate::graph::{Graph, GraphError, InputSocketId, Link, NodeId, OutputSocketId};
    pub use crate::graph_executor::{
        Executor, ExecutorLogger, GraphExecutor, SideEffectProvider, TracingLogger,
    };
    pub use crate::session::GraphSession;
    pub use crate::value::{Value, ValueType, ValueUsage};
}
