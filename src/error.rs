//! Pipeline-level error type

use thiserror::Error;

use crate::codegen::CodegenError;
use crate::lower::LowerError;
use crate::rom::RomError;
use crate::sema::SemaError;

/// Any failure between a checked AST and ROM bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("{0}")]
    Sema(#[from] SemaError),
    #[error("lowering: {0}")]
    Lower(#[from] LowerError),
    #[error("code generation: {0}")]
    Codegen(#[from] CodegenError),
    #[error("ROM assembly: {0}")]
    Rom(#[from] RomError),
}
