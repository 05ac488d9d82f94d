pub mod config;
pub mod datatype;
pub mod error;
pub mod event;
pub mod node;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use datatype::{CoercionMode, CoercionTable, DataType};
pub use error::{
    EngineError, ErrorDetail, ErrorKind, GraphexError, NodeError, Result, StructuralError,
    SubmitError, ValidationError,
};
pub use event::{Event, EventBus, EventKind, EventStream};
pub use node::{
    InputPort, NodeConfig, NodeContext, NodeRequest, NodeValues, OutputPort, PortDeclaration,
};
pub use traits::{NodeCatalog, NodeLogSink, NodeType};
pub use types::*;
