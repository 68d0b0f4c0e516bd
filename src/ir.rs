//! Intermediate representation
//!
//! An IR program is a tree of lexically nested blocks. Each block owns a
//! symbol table and an append-only instruction list. The program owns all
//! blocks in an arena and keeps a cursor, the current block, that decides
//! where new symbols and instructions land.
//!
//! # Usage
//!
//! ```ignore
//! let mut program = Program::new();
//! program.declare_symbol("x", Type::UInt8)?;
//! program.emit(Instruction::Copy { dest: Place::new("x"), src: Value::Immediate(5), width: Width::Byte });
//! program.open_block("startup", BlockKind::Startup);
//! // ...
//! program.close_block()?;
//! println!("{}", program.dump());
//! ```

use std::fmt::Write as _;

use indexmap::IndexMap;
use thiserror::Error;

use crate::types::Type;

/// Index of a block in the program's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(usize);

impl BlockId {
    pub const GLOBAL: BlockId = BlockId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

/// Program-wide label identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelId(pub u32);

impl std::fmt::Display for LabelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Global,
    Function,
    Scope,
    /// Lowered into the startup routine instead of the main program
    Startup,
}

impl std::fmt::Display for BlockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BlockKind::Global => "global",
            BlockKind::Function => "function",
            BlockKind::Scope => "scope",
            BlockKind::Startup => "startup",
        };
        write!(f, "{}", name)
    }
}

/// Where a symbol's storage lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    #[default]
    Auto,
    ZeroPage,
    Fixed(u16),
}

/// A typed, named storage location.
#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub name: String,
    pub ty: Type,
    pub placement: Placement,
}

/// A byte offset into a symbol's storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Place {
    pub symbol: String,
    pub offset: u16,
}

impl Place {
    pub fn new(symbol: &str) -> Self {
        Place { symbol: symbol.to_string(), offset: 0 }
    }

    pub fn offset_by(&self, delta: u16) -> Self {
        Place { symbol: self.symbol.clone(), offset: self.offset + delta }
    }
}

impl std::fmt::Display for Place {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.offset == 0 {
            write!(f, "{}", self.symbol)
        } else {
            write!(f, "{}+{}", self.symbol, self.offset)
        }
    }
}

/// Instruction source operand
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Immediate(u16),
    Place(Place),
    /// Absolute address of a symbol's storage
    AddressOf(String),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Immediate(n) => write!(f, "#{}", n),
            Value::Place(place) => write!(f, "{}", place),
            Value::AddressOf(name) => write!(f, "&{}", name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Word,
}

impl Width {
    pub fn bytes(self) -> u16 {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// `dest = src`, one or two bytes
    Copy { dest: Place, src: Value, width: Width },
    /// `dest = zero_extend(src)`, u8 to u16
    Widen { dest: Place, src: Place },
    Label(LabelId),
    Jump(LabelId),
    BranchIfZero { src: Place, target: LabelId },
    BranchIfNotZero { src: Place, target: LabelId },
    /// Spin forever
    Halt,
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Instruction::Copy { dest, src, width } => {
                let suffix = if *width == Width::Byte { "b" } else { "w" };
                write!(f, "copy.{} {}, {}", suffix, dest, src)
            }
            Instruction::Widen { dest, src } => write!(f, "widen {}, {}", dest, src),
            Instruction::Label(id) => write!(f, "{}:", id),
            Instruction::Jump(id) => write!(f, "jump {}", id),
            Instruction::BranchIfZero { src, target } => write!(f, "bz {}, {}", src, target),
            Instruction::BranchIfNotZero { src, target } => write!(f, "bnz {}, {}", src, target),
            Instruction::Halt => write!(f, "halt"),
        }
    }
}

/// One lexical scope.
#[derive(Debug, Clone)]
pub struct Block {
    pub name: String,
    pub kind: BlockKind,
    pub parent: Option<BlockId>,
    pub children: Vec<BlockId>,
    pub symbols: IndexMap<String, Symbol>,
    pub instructions: Vec<Instruction>,
}

impl Block {
    fn new(name: &str, kind: BlockKind, parent: Option<BlockId>) -> Self {
        Block {
            name: name.to_string(),
            kind,
            parent,
            children: Vec::new(),
            symbols: IndexMap::new(),
            instructions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IrError {
    #[error("duplicate symbol '{0}' in block '{1}'")]
    DuplicateSymbol(String, String),
    #[error("undefined symbol '{0}'")]
    UndefinedSymbol(String),
    #[error("symbol '{0}' has unresolved type")]
    UnresolvedType(String),
    #[error("cannot close the global block")]
    CloseGlobal,
}

/// The block tree plus the current-block cursor.
#[derive(Debug, Clone)]
pub struct Program {
    blocks: Vec<Block>,
    current: BlockId,
    next_label: u32,
}

impl Program {
    pub fn new() -> Self {
        Program {
            blocks: vec![Block::new("global", BlockKind::Global, None)],
            current: BlockId::GLOBAL,
            next_label: 0,
        }
    }

    pub fn global(&self) -> &Block {
        &self.blocks[BlockId::GLOBAL.0]
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0]
    }

    pub fn current(&self) -> BlockId {
        self.current
    }

    pub fn current_block(&self) -> &Block {
        &self.blocks[self.current.0]
    }

    /// Blocks in pre-order from global, children in creation order
    pub fn preorder(&self) -> Vec<BlockId> {
        let mut order = Vec::with_capacity(self.blocks.len());
        let mut stack = vec![BlockId::GLOBAL];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.blocks[id.0].children.iter().rev());
        }
        order
    }

    /// Open a child of the current block and make it current
    pub fn open_block(&mut self, name: &str, kind: BlockKind) -> BlockId {
        let id = BlockId(self.blocks.len());
        self.blocks.push(Block::new(name, kind, Some(self.current)));
        self.blocks[self.current.0].children.push(id);
        self.current = id;
        id
    }

    /// Return to the parent block. The closed block stays in the tree.
    pub fn close_block(&mut self) -> Result<BlockId, IrError> {
        let closed = self.current;
        let parent = self.blocks[closed.0].parent.ok_or(IrError::CloseGlobal)?;
        self.current = parent;
        Ok(closed)
    }

    pub fn declare_symbol(&mut self, name: &str, ty: Type) -> Result<&Symbol, IrError> {
        self.declare_symbol_at(name, ty, Placement::Auto)
    }

    /// Declare in the current block; duplicates within that block fail
    pub fn declare_symbol_at(
        &mut self,
        name: &str,
        ty: Type,
        placement: Placement,
    ) -> Result<&Symbol, IrError> {
        if !ty.is_resolved() {
            return Err(IrError::UnresolvedType(name.to_string()));
        }
        let block = &mut self.blocks[self.current.0];
        if block.symbols.contains_key(name) {
            return Err(IrError::DuplicateSymbol(name.to_string(), block.name.clone()));
        }
        let symbol = Symbol { name: name.to_string(), ty, placement };
        let entry = block.symbols.entry(name.to_string()).or_insert(symbol);
        Ok(entry)
    }

    pub fn emit(&mut self, instruction: Instruction) {
        self.blocks[self.current.0].instructions.push(instruction);
    }

    /// Resolve from the current block outward to global
    pub fn lookup_symbol(&self, name: &str) -> Result<&Symbol, IrError> {
        self.lookup_from(self.current, name)
    }

    /// Resolve from `start` outward to global
    pub fn lookup_from(&self, start: BlockId, name: &str) -> Result<&Symbol, IrError> {
        self.resolve(start, name).map(|(_, symbol)| symbol)
    }

    /// Like [`Program::lookup_from`], also returning the declaring block
    pub fn resolve(&self, start: BlockId, name: &str) -> Result<(BlockId, &Symbol), IrError> {
        let mut cursor = Some(start);
        while let Some(id) = cursor {
            let block = &self.blocks[id.0];
            if let Some(symbol) = block.symbols.get(name) {
                return Ok((id, symbol));
            }
            cursor = block.parent;
        }
        Err(IrError::UndefinedSymbol(name.to_string()))
    }

    /// True if `id` or one of its ancestors is a startup block
    pub fn in_startup(&self, id: BlockId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let block = &self.blocks[current.0];
            if block.kind == BlockKind::Startup {
                return true;
            }
            cursor = block.parent;
        }
        false
    }

    pub fn new_label(&mut self) -> LabelId {
        let id = LabelId(self.next_label);
        self.next_label += 1;
        id
    }

    /// Deterministic textual trace of the block tree
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_block(BlockId::GLOBAL, 0, &mut out);
        out
    }

    fn dump_block(&self, id: BlockId, depth: usize, out: &mut String) {
        let block = &self.blocks[id.0];
        let indent = "  ".repeat(depth);
        let _ = writeln!(out, "{}block {} ({})", indent, block.name, block.kind);
        for symbol in block.symbols.values() {
            let _ = write!(out, "{}  symbol {}: {}", indent, symbol.name, symbol.ty);
            match symbol.placement {
                Placement::Auto => {}
                Placement::ZeroPage => out.push_str(" @zeropage"),
                Placement::Fixed(addr) => {
                    let _ = write!(out, " @${:04X}", addr);
                }
            }
            out.push('\n');
        }
        for instruction in &block.instructions {
            let _ = writeln!(out, "{}  {}", indent, instruction);
        }
        for &child in &block.children {
            self.dump_block(child, depth + 1, out);
        }
    }
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}
