//! End-to-end tests for the cartc pipeline
//!
//! Programs are built as ASTs, compiled to iNES images, and then run on a
//! small 6502 interpreter that knows only the instructions the backend
//! emits. A run starts at the RESET vector and stops at the first
//! `JMP` to itself (the halt loop).

use std::collections::HashMap;

use cartc::ast::{Node, Program};
use cartc::rom::{PrgSize, Rom};
use cartc::sema::SemaError;
use cartc::types::{Type, TypeError};
use cartc::{CompileError, Session, Target};

/// Just enough of a 6502 to execute generated code
struct Cpu<'a> {
    rom: &'a Rom,
    ram: [u8; 0x800],
    io: HashMap<u16, u8>,
    a: u8,
    x: u8,
    sp: u8,
    pc: u16,
    zero: bool,
    trace: Vec<u16>,
}

impl<'a> Cpu<'a> {
    fn new(rom: &'a Rom) -> Self {
        Cpu {
            rom,
            ram: [0; 0x800],
            io: HashMap::new(),
            a: 0,
            x: 0,
            sp: 0,
            pc: rom.vectors().reset,
            zero: false,
            trace: Vec::new(),
        }
    }

    fn read(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x1FFF => self.ram[addr as usize & 0x7FF],
            0x8000..=0xFFFF => self.rom.prg[(addr as usize - 0x8000) % self.rom.prg.len()],
            _ => self.io.get(&addr).copied().unwrap_or(0),
        }
    }

    fn write(&mut self, addr: u16, value: u8) {
        match addr {
            0x0000..=0x1FFF => self.ram[addr as usize & 0x7FF] = value,
            0x8000..=0xFFFF => panic!("write to ROM at ${:04X}", addr),
            _ => {
                self.io.insert(addr, value);
            }
        }
    }

    fn fetch(&mut self) -> u8 {
        let byte = self.read(self.pc);
        self.pc = self.pc.wrapping_add(1);
        byte
    }

    fn fetch_word(&mut self) -> u16 {
        let lo = self.fetch();
        let hi = self.fetch();
        u16::from_le_bytes([lo, hi])
    }

    fn load(&mut self, value: u8) {
        self.a = value;
        self.zero = value == 0;
    }

    fn branch(&mut self, taken: bool) {
        let offset = self.fetch() as i8;
        if taken {
            self.pc = self.pc.wrapping_add(offset as u16);
        }
    }

    /// Run until the halt loop; panics on an unknown opcode
    fn run(&mut self) {
        for _ in 0..10_000 {
            let at = self.pc;
            self.trace.push(at);
            match self.fetch() {
                0x78 | 0xD8 => {}
                0xA2 => self.x = self.fetch(),
                0x9A => self.sp = self.x,
                0xA9 => {
                    let value = self.fetch();
                    self.load(value);
                }
                0xA5 => {
                    let addr = self.fetch() as u16;
                    self.load(self.read(addr));
                }
                0xAD => {
                    let addr = self.fetch_word();
                    self.load(self.read(addr));
                }
                0x85 => {
                    let addr = self.fetch() as u16;
                    self.write(addr, self.a);
                }
                0x8D => {
                    let addr = self.fetch_word();
                    self.write(addr, self.a);
                }
                0xF0 => self.branch(self.zero),
                0xD0 => self.branch(!self.zero),
                0x4C => {
                    let target = self.fetch_word();
                    if target == at {
                        return;
                    }
                    self.pc = target;
                }
                op => panic!("unexpected opcode ${:02X} at ${:04X}", op, at),
            }
        }
        panic!("program did not halt");
    }

    fn peek_word(&self, addr: u16) -> u16 {
        u16::from_le_bytes([self.read(addr), self.read(addr + 1)])
    }
}

fn build(decls: Vec<Node>, target: Target) -> Result<(Rom, HashMap<String, u16>), CompileError> {
    let mut program = Program { decls };
    let mut session = Session::new(target);
    let ir = session.compile(&mut program)?;
    let symbols = cartc::generate(&ir, &target)?.symbols.into_iter().collect();
    let rom = cartc::assemble(&ir, &target)?;
    Ok((rom, symbols))
}

#[test]
fn test_u8_widens_into_u16() {
    let (rom, symbols) = build(
        vec![
            Node::var("lives", Type::UInt8, Some(Node::literal(0xC8))),
            Node::var("score", Type::UInt16, Some(Node::ident("lives"))),
        ],
        Target::default(),
    )
    .unwrap();

    let mut cpu = Cpu::new(&rom);
    cpu.ram[(symbols["score"] + 1) as usize] = 0xAA;
    cpu.run();
    assert_eq!(cpu.read(symbols["lives"]), 0xC8);
    assert_eq!(cpu.peek_word(symbols["score"]), 0x00C8);
}

#[test]
fn test_narrowed_value_widens_back() {
    let (rom, symbols) = build(
        vec![
            Node::var("w", Type::UInt16, Some(Node::literal(0x1234))),
            Node::var("c", Type::UInt16, Some(Node::cast(Node::ident("w"), Type::UInt8))),
            Node::var("k", Type::UInt16, Some(Node::cast(Node::literal(5), Type::UInt8))),
        ],
        Target::default(),
    )
    .unwrap();

    let mut cpu = Cpu::new(&rom);
    cpu.ram[(symbols["c"] + 1) as usize] = 0xAA;
    cpu.run();
    assert_eq!(cpu.peek_word(symbols["w"]), 0x1234);
    assert_eq!(cpu.peek_word(symbols["c"]), 0x0034);
    assert_eq!(cpu.peek_word(symbols["k"]), 0x0005);
}

#[test]
fn test_u16_literal_into_u8_is_type_error() {
    let err = build(
        vec![Node::var("b", Type::UInt8, Some(Node::literal(300).at(1, 15))).at(1, 1)],
        Target::default(),
    )
    .unwrap_err();
    let CompileError::Sema(SemaError::Types(diagnostics)) = err else {
        panic!("expected a type error, got {:?}", err);
    };
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(
        diagnostics[0].error,
        TypeError::Mismatch { expected: Type::UInt8, found: Type::UInt16 }
    );
    assert_eq!(diagnostics[0].location.column, 15);
}

#[test]
fn test_header_and_vectors() {
    let (rom, _) = build(vec![Node::var("x", Type::UInt8, Some(Node::literal(1)))], Target::default())
        .unwrap();
    let bytes = rom.to_bytes();
    assert_eq!(bytes.len(), 16 + 0x8000);
    assert_eq!(&bytes[..8], &[0x4E, 0x45, 0x53, 0x1A, 0x02, 0x00, 0x00, 0x00]);
    assert!(bytes[8..16].iter().all(|b| *b == 0));

    // Reset prologue sits at the bank base
    assert_eq!(&bytes[16..21], &[0x78, 0xD8, 0xA2, 0xFF, 0x9A]);
    let vectors = rom.vectors();
    assert_eq!(vectors.reset, 0x8000);
    assert_eq!(vectors.nmi, vectors.irq);
    let stub = (vectors.nmi - 0x8000) as usize;
    assert_eq!(rom.prg[stub], 0x40);
    assert_eq!(&bytes[bytes.len() - 6..], &[
        vectors.nmi as u8, (vectors.nmi >> 8) as u8, 0x00, 0x80, vectors.irq as u8, (vectors.irq >> 8) as u8,
    ]);
}

#[test]
fn test_nrom128_layout() {
    let target = Target { prg: PrgSize::Nrom128, ..Target::default() };
    let (rom, symbols) = build(
        vec![
            Node::var("w", Type::UInt16, Some(Node::literal(0xBEEF)))
                .with_attribute(Node::attribute("zeropage", vec![])),
        ],
        target,
    )
    .unwrap();
    assert_eq!(rom.header.prg_banks, 1);
    assert_eq!(rom.prg.len(), 0x4000);
    assert_eq!(rom.vectors().reset, 0xC000);
    assert_eq!(symbols["w"], 0x0010);

    let mut cpu = Cpu::new(&rom);
    cpu.run();
    assert_eq!(cpu.peek_word(0x0010), 0xBEEF);
}

#[test]
fn test_startup_routine_runs_first() {
    let (rom, symbols) = build(
        vec![
            Node::var("main_flag", Type::UInt8, Some(Node::literal(2))),
            Node::var("boot_flag", Type::UInt8, Some(Node::literal(9)))
                .with_attribute(Node::attribute("startup", vec![])),
        ],
        Target::default(),
    )
    .unwrap();

    let reset = rom.vectors().reset;
    assert_ne!(reset, 0x8000);
    let offset = (reset - 0x8000) as usize;
    // LDA #9; STA boot_flag; JMP $8000
    let boot = symbols["boot_flag"].to_le_bytes();
    assert_eq!(
        &rom.prg[offset..offset + 8],
        &[0xA9, 0x09, 0x8D, boot[0], boot[1], 0x4C, 0x00, 0x80]
    );

    let mut cpu = Cpu::new(&rom);
    cpu.run();
    assert_eq!(cpu.trace[0], reset);
    assert!(cpu.trace.contains(&0x8000));
    assert_eq!(cpu.read(symbols["boot_flag"]), 9);
    assert_eq!(cpu.read(symbols["main_flag"]), 2);
}

#[test]
fn test_arrays_pointers_and_fixed_addresses() {
    let (rom, symbols) = build(
        vec![
            Node::var(
                "palette",
                Type::array(Type::UInt8, 4),
                Some(Node::array(vec![Node::literal(0x0F), Node::literal(0x16), Node::literal(0x27)])),
            ),
            Node::var("copy", Type::array(Type::UInt8, 4), Some(Node::ident("palette"))),
            Node::var("ptr", Type::None, Some(Node::address_of("palette"))),
            Node::var("mask", Type::UInt8, Some(Node::literal(0x1E)))
                .with_attribute(Node::attribute("address", vec![("at", Node::literal(0x2001))])),
            Node::var("lo", Type::UInt8, Some(Node::cast(Node::literal(0x1234), Type::UInt8))),
        ],
        Target::default(),
    )
    .unwrap();

    let mut cpu = Cpu::new(&rom);
    cpu.run();
    let palette = symbols["palette"];
    assert_eq!(cpu.read(palette), 0x0F);
    assert_eq!(cpu.read(palette + 2), 0x27);
    assert_eq!(cpu.read(symbols["copy"] + 1), 0x16);
    assert_eq!(cpu.peek_word(symbols["ptr"]), palette);
    assert_eq!(symbols["mask"], 0x2001);
    assert_eq!(cpu.io[&0x2001], 0x1E);
    assert_eq!(cpu.read(symbols["lo"]), 0x34);
}

#[test]
fn test_duplicate_declaration_is_fatal() {
    let err = build(
        vec![Node::var("a", Type::UInt8, None), Node::var("a", Type::UInt8, None)],
        Target::default(),
    )
    .unwrap_err();
    assert!(matches!(err, CompileError::Sema(SemaError::Duplicate { .. })));
}

#[test]
fn test_emit_and_read_back() {
    let target = Target::default();
    let mut program = Program { decls: vec![Node::var("x", Type::UInt8, Some(Node::literal(7)))] };
    let ir = Session::new(target).compile(&mut program).unwrap();

    let code = cartc::emit(&ir, &target).unwrap();
    // prologue, LDA #7, STA $0300, JMP self, RTI
    assert_eq!(
        code,
        vec![0x78, 0xD8, 0xA2, 0xFF, 0x9A, 0xA9, 0x07, 0x8D, 0x00, 0x03, 0x4C, 0x0A, 0x80, 0x40]
    );

    let rom = cartc::assemble(&ir, &target).unwrap();
    assert_eq!(Rom::from_bytes(&rom.to_bytes()).unwrap(), rom);
}
