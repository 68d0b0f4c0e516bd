//! cartc - compiler core for 6502 cartridge images
//!
//! Takes a typed declaration language through semantic analysis, a
//! block-structured IR and a 6502 backend, and packs the result into an
//! iNES (mapper 0) image.
//!
//! Pipeline:
//! - [`sema`] resolves types and inserts implicit casts
//! - [`lower`] builds the [`ir::Program`]
//! - [`codegen`] emits the main program and the startup routine
//! - [`rom`] lays out the PRG bank and injects the startup routine
//!
//! # Usage
//!
//! ```ignore
//! let mut session = Session::new(Target::default());
//! let rom = session.build(&mut program)?;
//! std::fs::write("game.nes", rom.to_bytes())?;
//! ```

pub mod types;
pub mod ast;
pub mod sema;
pub mod ir;
pub mod lower;
pub mod opcodes;
pub mod codegen;
pub mod rom;
pub mod error;

use log::info;

pub use error::CompileError;

use codegen::{CodeGenerator, Output};
use rom::{Header, Mirroring, PrgSize, Rom};
use sema::{Analyzer, TypeEnv};
use types::TypeNameCache;

/// Cartridge configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Target {
    pub prg: PrgSize,
    pub mirroring: Mirroring,
    /// 8 KiB CHR ROM banks, 0 for CHR RAM
    pub chr_banks: u8,
    /// Battery-backed PRG RAM
    pub battery: bool,
}

impl Target {
    pub fn header(&self) -> Header {
        Header {
            chr_banks: self.chr_banks,
            mirroring: self.mirroring,
            battery: self.battery,
            ..Header::new(self.prg)
        }
    }
}

/// One compilation session. Owns the type-name cache, which lives as long
/// as the session does.
#[derive(Debug)]
pub struct Session {
    target: Target,
    names: TypeNameCache,
}

impl Session {
    pub fn new(target: Target) -> Self {
        Session { target, names: TypeNameCache::new() }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn names(&mut self) -> &mut TypeNameCache {
        &mut self.names
    }

    /// Type-check `program` in place
    pub fn analyze(&mut self, program: &mut ast::Program) -> Result<TypeEnv, CompileError> {
        Ok(Analyzer::new(&mut self.names).check_program(program)?)
    }

    /// Analyze and lower to IR
    pub fn compile(&mut self, program: &mut ast::Program) -> Result<ir::Program, CompileError> {
        self.analyze(program)?;
        let ir = lower::lower(program)?;
        info!("lowered {} declarations", program.decls.len());
        Ok(ir)
    }

    /// Full pipeline: AST to cartridge image
    pub fn build(&mut self, program: &mut ast::Program) -> Result<Rom, CompileError> {
        let ir = self.compile(program)?;
        assemble(&ir, &self.target)
    }
}

/// Run the backend for `target`
pub fn generate(program: &ir::Program, target: &Target) -> Result<Output, CompileError> {
    let mut codegen = CodeGenerator::new(program, target.prg.base_address());
    Ok(codegen.generate()?)
}

/// Machine code of the main program, loaded at the bank base
pub fn emit(program: &ir::Program, target: &Target) -> Result<Vec<u8>, CompileError> {
    Ok(generate(program, target)?.main.bytes)
}

/// Build the cartridge image for an IR program
pub fn assemble(program: &ir::Program, target: &Target) -> Result<Rom, CompileError> {
    let output = generate(program, target)?;
    let bank = rom::layout_bank(&output.main, output.vectors, target.prg)?;
    let image = rom::assemble(target.header(), bank, &output.startup)?;
    info!(
        "assembled {:?} image: {} bytes of code, {} bytes of startup",
        target.prg,
        output.main.len(),
        output.startup.len()
    );
    Ok(image)
}
