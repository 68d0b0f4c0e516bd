//! 6502 code generator
//!
//! Lowers an IR program into 6502 machine code. Two layers:
//!
//! - [`Emitter`] appends encoded instructions to a buffer, one operation per
//!   addressing-mode family, and tracks the program counter, labels and
//!   fixups for forward branches and jumps.
//! - [`CodeGenerator`] allocates storage for IR symbols, selects
//!   instructions for IR instructions, and produces the main program and
//!   the startup routine as separate [`Segment`]s.
//!
//! # Memory Layout
//!
//! - `$0010-$00FF`: zero-page variables (`@zeropage`)
//! - `$0100-$01FF`: hardware stack
//! - `$0300-$07FF`: general variables
//! - `$8000`/`$C000`: PRG bank, code starts at the bank base
//!
//! # Usage
//!
//! ```ignore
//! let mut codegen = CodeGenerator::new(&program, 0x8000);
//! let output = codegen.generate()?;
//! ```

use std::collections::HashMap;

use log::debug;
use thiserror::Error;

use crate::ir::{self, BlockId, Instruction, IrError, LabelId, Place, Placement, Value, Width};
use crate::opcodes::{opcode, AddressingMode, Mnemonic};
use crate::types::TypeError;

// Memory layout constants
const ZERO_PAGE_START: u16 = 0x0010;
const ZERO_PAGE_END: u16 = 0x0100;
const RAM_START: u16 = 0x0300;
const RAM_END: u16 = 0x0800;
const STACK_TOP: u8 = 0xFF;

/// Size of one branch instruction: opcode + displacement
const BRANCH_LEN: i32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodegenError {
    #[error("program counter overflow: ${0:X} exceeds the 16-bit address space")]
    Overflow(u32),
    #[error("branch from ${from:04X} to ${to:04X} is out of range")]
    BranchOutOfRange { from: u16, to: u16 },
    #[error("label {0} used but never bound")]
    UnboundLabel(usize),
    #[error("no storage left for '{0}'")]
    StorageExhausted(String),
    #[error(transparent)]
    Symbol(#[from] IrError),
    #[error("symbol '{0}': {1}")]
    Type(String, TypeError),
}

/// Handle to a position in the emitted code, bound once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FixupKind {
    Relative,
    Absolute,
}

#[derive(Debug, Clone)]
struct Fixup {
    /// Offset of the operand byte(s) in the buffer
    offset: usize,
    label: Label,
    kind: FixupKind,
}

/// Bytes for one routine, assembled as if loaded at `origin`.
///
/// `relocations` lists offsets of absolute 16-bit operands that point
/// inside the segment; [`Segment::rebase`] moves them with the code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Segment {
    pub origin: u16,
    pub bytes: Vec<u8>,
    pub relocations: Vec<usize>,
}

impl Segment {
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Move the segment to `origin`, patching internal absolute addresses
    pub fn rebase(&mut self, origin: u16) {
        let delta = origin.wrapping_sub(self.origin);
        for &offset in &self.relocations {
            let old = u16::from_le_bytes([self.bytes[offset], self.bytes[offset + 1]]);
            let new = old.wrapping_add(delta).to_le_bytes();
            self.bytes[offset] = new[0];
            self.bytes[offset + 1] = new[1];
        }
        self.origin = origin;
    }
}

/// Signed displacement byte for a branch at `branch_addr` to `target`.
///
/// The CPU adds the sign-extended byte to the address after the 2-byte
/// branch instruction.
pub fn branch_displacement(branch_addr: u16, target: u16) -> Result<u8, CodegenError> {
    let delta = target as i32 - (branch_addr as i32 + BRANCH_LEN);
    if !(-128..=127).contains(&delta) {
        return Err(CodegenError::BranchOutOfRange { from: branch_addr, to: target });
    }
    Ok(delta as i8 as u8)
}

/// Machine-code buffer with a program counter.
///
/// `pc` is the offset into the buffer; `base` is where the buffer is
/// mapped in the CPU address space.
#[derive(Debug, Clone)]
pub struct Emitter {
    code: Vec<u8>,
    base: u16,
    labels: Vec<Option<u16>>,
    fixups: Vec<Fixup>,
}

impl Emitter {
    pub fn new(base: u16) -> Self {
        Emitter { code: Vec::new(), base, labels: Vec::new(), fixups: Vec::new() }
    }

    pub fn pc(&self) -> u16 {
        self.code.len() as u16
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    /// Absolute address of the next byte
    pub fn current_addr(&self) -> u16 {
        self.base.wrapping_add(self.pc())
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    fn emit(&mut self, mnemonic: Mnemonic, mode: AddressingMode, operand: &[u8]) -> Result<(), CodegenError> {
        debug_assert_eq!(operand.len() as u16, mode.operand_len());
        let byte = opcode(mnemonic, mode)
            .unwrap_or_else(|| panic!("illegal instruction: {} {:?}", mnemonic, mode));
        let end = self.base as u32 + self.code.len() as u32 + 1 + operand.len() as u32;
        if end > 0x1_0000 {
            return Err(CodegenError::Overflow(end));
        }
        self.code.push(byte);
        self.code.extend_from_slice(operand);
        Ok(())
    }

    pub fn implied(&mut self, m: Mnemonic) -> Result<(), CodegenError> {
        self.emit(m, AddressingMode::Implied, &[])
    }

    pub fn accumulator(&mut self, m: Mnemonic) -> Result<(), CodegenError> {
        self.emit(m, AddressingMode::Accumulator, &[])
    }

    pub fn immediate(&mut self, m: Mnemonic, value: u8) -> Result<(), CodegenError> {
        self.emit(m, AddressingMode::Immediate, &[value])
    }

    pub fn zero_page(&mut self, m: Mnemonic, addr: u8) -> Result<(), CodegenError> {
        self.emit(m, AddressingMode::ZeroPage, &[addr])
    }

    pub fn zero_page_x(&mut self, m: Mnemonic, addr: u8) -> Result<(), CodegenError> {
        self.emit(m, AddressingMode::ZeroPageX, &[addr])
    }

    pub fn zero_page_y(&mut self, m: Mnemonic, addr: u8) -> Result<(), CodegenError> {
        self.emit(m, AddressingMode::ZeroPageY, &[addr])
    }

    pub fn absolute(&mut self, m: Mnemonic, addr: u16) -> Result<(), CodegenError> {
        self.emit(m, AddressingMode::Absolute, &addr.to_le_bytes())
    }

    pub fn absolute_x(&mut self, m: Mnemonic, addr: u16) -> Result<(), CodegenError> {
        self.emit(m, AddressingMode::AbsoluteX, &addr.to_le_bytes())
    }

    pub fn absolute_y(&mut self, m: Mnemonic, addr: u16) -> Result<(), CodegenError> {
        self.emit(m, AddressingMode::AbsoluteY, &addr.to_le_bytes())
    }

    pub fn indirect(&mut self, m: Mnemonic, addr: u16) -> Result<(), CodegenError> {
        self.emit(m, AddressingMode::Indirect, &addr.to_le_bytes())
    }

    pub fn indexed_indirect(&mut self, m: Mnemonic, zp: u8) -> Result<(), CodegenError> {
        self.emit(m, AddressingMode::IndexedIndirect, &[zp])
    }

    pub fn indirect_indexed(&mut self, m: Mnemonic, zp: u8) -> Result<(), CodegenError> {
        self.emit(m, AddressingMode::IndirectIndexed, &[zp])
    }

    /// Branch to an already known absolute address
    pub fn relative(&mut self, m: Mnemonic, target: u16) -> Result<(), CodegenError> {
        let displacement = branch_displacement(self.current_addr(), target)?;
        self.emit(m, AddressingMode::Relative, &[displacement])
    }

    /// Zero-page form when the address fits, absolute otherwise
    pub fn memory(&mut self, m: Mnemonic, addr: u16) -> Result<(), CodegenError> {
        match u8::try_from(addr) {
            Ok(zp) => self.zero_page(m, zp),
            Err(_) => self.absolute(m, addr),
        }
    }

    /// Current absolute address, for backward branch targets
    pub fn emit_label(&self) -> u16 {
        self.current_addr()
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind_label(&mut self, label: Label) {
        assert!(self.labels[label.0].is_none(), "label {} bound twice", label.0);
        self.labels[label.0] = Some(self.current_addr());
    }

    pub fn label_addr(&self, label: Label) -> Option<u16> {
        self.labels[label.0]
    }

    /// Branch to a label, bound or not
    pub fn branch_to(&mut self, m: Mnemonic, label: Label) -> Result<(), CodegenError> {
        if let Some(target) = self.label_addr(label) {
            return self.relative(m, target);
        }
        self.emit(m, AddressingMode::Relative, &[0x00])?;
        self.fixups.push(Fixup { offset: self.code.len() - 1, label, kind: FixupKind::Relative });
        Ok(())
    }

    /// `JMP label`; always patched at finish so the operand is relocatable
    pub fn jump_to(&mut self, label: Label) -> Result<(), CodegenError> {
        self.emit(Mnemonic::Jmp, AddressingMode::Absolute, &[0x00, 0x00])?;
        self.fixups.push(Fixup { offset: self.code.len() - 2, label, kind: FixupKind::Absolute });
        Ok(())
    }

    /// Resolve fixups and hand back the segment
    pub fn finish(mut self) -> Result<Segment, CodegenError> {
        let mut relocations = Vec::new();
        for fixup in &self.fixups {
            let target = self.label_addr(fixup.label).ok_or(CodegenError::UnboundLabel(fixup.label.0))?;
            match fixup.kind {
                FixupKind::Relative => {
                    let branch_addr = self.base.wrapping_add(fixup.offset as u16 - 1);
                    self.code[fixup.offset] = branch_displacement(branch_addr, target)?;
                }
                FixupKind::Absolute => {
                    let [lo, hi] = target.to_le_bytes();
                    self.code[fixup.offset] = lo;
                    self.code[fixup.offset + 1] = hi;
                    relocations.push(fixup.offset);
                }
            }
        }
        Ok(Segment { origin: self.base, bytes: self.code, relocations })
    }
}

/// Addresses written to the last six bytes of the bank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Vectors {
    pub nmi: u16,
    pub reset: u16,
    pub irq: u16,
}

/// Result of lowering an IR program
#[derive(Debug, Clone)]
pub struct Output {
    /// Main program, located at the bank base
    pub main: Segment,
    /// Startup routine, origin 0, to be placed by the ROM assembler
    pub startup: Segment,
    pub vectors: Vectors,
    /// Storage address of each global symbol, for listings
    pub symbols: Vec<(String, u16)>,
}

/// IR to 6502 code generator.
pub struct CodeGenerator<'a> {
    program: &'a ir::Program,
    base: u16,
    // Storage: (declaring block, name) -> address
    storage: HashMap<(BlockId, String), u16>,
    zero_page_next: u16,
    ram_next: u16,
    // IR labels -> emitter labels for the segment being generated
    labels: HashMap<LabelId, Label>,
}

impl<'a> CodeGenerator<'a> {
    pub fn new(program: &'a ir::Program, base: u16) -> Self {
        CodeGenerator {
            program,
            base,
            storage: HashMap::new(),
            zero_page_next: ZERO_PAGE_START,
            ram_next: RAM_START,
            labels: HashMap::new(),
        }
    }

    /// Generate the main segment and the startup routine
    pub fn generate(&mut self) -> Result<Output, CodegenError> {
        self.allocate_storage()?;

        let (main_blocks, startup_blocks): (Vec<BlockId>, Vec<BlockId>) = self
            .program
            .preorder()
            .into_iter()
            .partition(|id| !self.program.in_startup(*id));

        // Main program: reset prologue, user code, spin, interrupt stub
        let mut em = Emitter::new(self.base);
        let reset = em.emit_label();
        em.implied(Mnemonic::Sei)?;
        em.implied(Mnemonic::Cld)?;
        em.immediate(Mnemonic::Ldx, STACK_TOP)?;
        em.implied(Mnemonic::Txs)?;
        self.labels.clear();
        for id in &main_blocks {
            self.gen_block(&mut em, *id)?;
        }
        self.gen_halt(&mut em)?;
        let interrupt = em.emit_label();
        em.implied(Mnemonic::Rti)?;
        let main = em.finish()?;
        debug!("main segment: {} bytes at ${:04X}", main.len(), main.origin);

        let mut em = Emitter::new(0);
        self.labels.clear();
        for id in &startup_blocks {
            self.gen_block(&mut em, *id)?;
        }
        let startup = em.finish()?;
        debug!("startup segment: {} bytes", startup.len());

        let symbols = self
            .program
            .global()
            .symbols
            .keys()
            .filter_map(|name| {
                self.storage.get(&(BlockId::GLOBAL, name.clone())).map(|addr| (name.clone(), *addr))
            })
            .collect();

        Ok(Output {
            main,
            startup,
            vectors: Vectors { nmi: interrupt, reset, irq: interrupt },
            symbols,
        })
    }

    fn allocate_storage(&mut self) -> Result<(), CodegenError> {
        let program = self.program;
        for id in program.preorder() {
            for symbol in program.block(id).symbols.values() {
                let size = symbol
                    .ty
                    .size()
                    .map_err(|e| CodegenError::Type(symbol.name.clone(), e))?;
                let addr = match symbol.placement {
                    Placement::Fixed(addr) => {
                        if addr as u32 + size as u32 > 0x1_0000 {
                            return Err(CodegenError::StorageExhausted(symbol.name.clone()));
                        }
                        addr
                    }
                    Placement::ZeroPage => {
                        Self::bump(&mut self.zero_page_next, size, ZERO_PAGE_END, &symbol.name)?
                    }
                    Placement::Auto => Self::bump(&mut self.ram_next, size, RAM_END, &symbol.name)?,
                };
                debug!("{} ({}) -> ${:04X}", symbol.name, symbol.ty, addr);
                self.storage.insert((id, symbol.name.clone()), addr);
            }
        }
        Ok(())
    }

    fn bump(next: &mut u16, size: u16, end: u16, name: &str) -> Result<u16, CodegenError> {
        let addr = *next;
        if addr as u32 + size as u32 > end as u32 {
            return Err(CodegenError::StorageExhausted(name.to_string()));
        }
        *next = addr + size;
        Ok(addr)
    }

    fn address_of(&self, block: BlockId, name: &str) -> Result<u16, CodegenError> {
        let (owner, _) = self.program.resolve(block, name)?;
        Ok(self.storage[&(owner, name.to_string())])
    }

    fn place_addr(&self, block: BlockId, place: &Place) -> Result<u16, CodegenError> {
        Ok(self.address_of(block, &place.symbol)?.wrapping_add(place.offset))
    }

    fn label(&mut self, em: &mut Emitter, id: LabelId) -> Label {
        *self.labels.entry(id).or_insert_with(|| em.new_label())
    }

    fn gen_block(&mut self, em: &mut Emitter, id: BlockId) -> Result<(), CodegenError> {
        let program = self.program;
        for instruction in &program.block(id).instructions {
            self.gen_instruction(em, id, instruction)?;
        }
        Ok(())
    }

    fn gen_instruction(
        &mut self,
        em: &mut Emitter,
        block: BlockId,
        instruction: &Instruction,
    ) -> Result<(), CodegenError> {
        match instruction {
            Instruction::Copy { dest, src, width } => {
                let dest_addr = self.place_addr(block, dest)?;
                for i in 0..width.bytes() {
                    match src {
                        Value::Immediate(n) => em.immediate(Mnemonic::Lda, (n >> (8 * i)) as u8)?,
                        Value::Place(place) => {
                            let addr = self.place_addr(block, place)?;
                            em.memory(Mnemonic::Lda, addr.wrapping_add(i))?;
                        }
                        Value::AddressOf(name) => {
                            let addr = self.address_of(block, name)?;
                            em.immediate(Mnemonic::Lda, (addr >> (8 * i)) as u8)?;
                        }
                    }
                    em.memory(Mnemonic::Sta, dest_addr.wrapping_add(i))?;
                }
            }

            Instruction::Widen { dest, src } => {
                let dest_addr = self.place_addr(block, dest)?;
                let src_addr = self.place_addr(block, src)?;
                em.memory(Mnemonic::Lda, src_addr)?;
                em.memory(Mnemonic::Sta, dest_addr)?;
                em.immediate(Mnemonic::Lda, 0)?;
                em.memory(Mnemonic::Sta, dest_addr.wrapping_add(1))?;
            }

            Instruction::Label(id) => {
                let label = self.label(em, *id);
                em.bind_label(label);
            }

            Instruction::Jump(id) => {
                let label = self.label(em, *id);
                em.jump_to(label)?;
            }

            Instruction::BranchIfZero { src, target } => {
                let addr = self.place_addr(block, src)?;
                em.memory(Mnemonic::Lda, addr)?;
                let label = self.label(em, *target);
                em.branch_to(Mnemonic::Beq, label)?;
            }

            Instruction::BranchIfNotZero { src, target } => {
                let addr = self.place_addr(block, src)?;
                em.memory(Mnemonic::Lda, addr)?;
                let label = self.label(em, *target);
                em.branch_to(Mnemonic::Bne, label)?;
            }

            Instruction::Halt => self.gen_halt(em)?,
        }
        Ok(())
    }

    fn gen_halt(&mut self, em: &mut Emitter) -> Result<(), CodegenError> {
        let spin = em.new_label();
        em.bind_label(spin);
        em.jump_to(spin)
    }
}
