//! Code execution: the scene DSL front end, the persistent execution
//! context, and the CONTEXT compactor.

pub mod compact;
pub mod context;
pub mod lexer;
pub mod parser;
pub mod value;

pub use compact::CodeCompactor;
pub use context::{is_constructor, ExecOutcome, ExecutionContext, Executor};
pub use parser::{parse_program, Stmt, StmtKind, StreamingParser};
pub use value::Value;
