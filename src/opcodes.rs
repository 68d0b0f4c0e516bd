//! 6502 opcode table
//!
//! Maps a (mnemonic, addressing mode) pair to its single opcode byte.
//! Only the documented instruction set is encoded; every other pair is
//! illegal and yields `None`.

/// Instruction mnemonics of the documented 6502 instruction set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[rustfmt::skip]
pub enum Mnemonic {
    Adc, And, Asl, Bcc, Bcs, Beq, Bit, Bmi, Bne, Bpl, Brk, Bvc, Bvs, Clc,
    Cld, Cli, Clv, Cmp, Cpx, Cpy, Dec, Dex, Dey, Eor, Inc, Inx, Iny, Jmp,
    Jsr, Lda, Ldx, Ldy, Lsr, Nop, Ora, Pha, Php, Pla, Plp, Rol, Ror, Rti,
    Rts, Sbc, Sec, Sed, Sei, Sta, Stx, Sty, Tax, Tay, Tsx, Txa, Txs, Tya,
}

/// Operand-fetch strategy encoded in the opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressingMode {
    Implied,
    Accumulator,
    Immediate,
    ZeroPage,
    ZeroPageX,
    ZeroPageY,
    Absolute,
    AbsoluteX,
    AbsoluteY,
    Indirect,
    /// `(zp,X)`
    IndexedIndirect,
    /// `(zp),Y`
    IndirectIndexed,
    Relative,
}

impl AddressingMode {
    /// Number of operand bytes following the opcode
    pub fn operand_len(self) -> u16 {
        use AddressingMode::*;
        match self {
            Implied | Accumulator => 0,
            Immediate | ZeroPage | ZeroPageX | ZeroPageY | IndexedIndirect | IndirectIndexed
            | Relative => 1,
            Absolute | AbsoluteX | AbsoluteY | Indirect => 2,
        }
    }
}

impl Mnemonic {
    pub fn is_branch(self) -> bool {
        use Mnemonic::*;
        matches!(self, Bcc | Bcs | Beq | Bmi | Bne | Bpl | Bvc | Bvs)
    }
}

impl std::fmt::Display for Mnemonic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format!("{:?}", self).to_uppercase())
    }
}

/// Opcode byte for `mnemonic` in `mode`, or `None` if the CPU has no such
/// encoding.
pub fn opcode(mnemonic: Mnemonic, mode: AddressingMode) -> Option<u8> {
    use AddressingMode::*;
    use Mnemonic::*;

    // ALU group shares one layout: base + mode offset
    let alu = |base: u8| -> Option<u8> {
        match mode {
            IndexedIndirect => Some(base + 0x01),
            ZeroPage => Some(base + 0x05),
            Immediate => Some(base + 0x09),
            Absolute => Some(base + 0x0D),
            IndirectIndexed => Some(base + 0x11),
            ZeroPageX => Some(base + 0x15),
            AbsoluteY => Some(base + 0x19),
            AbsoluteX => Some(base + 0x1D),
            _ => None,
        }
    };

    // Shift/rotate group
    let shift = |base: u8| -> Option<u8> {
        match mode {
            ZeroPage => Some(base + 0x06),
            Accumulator => Some(base + 0x0A),
            Absolute => Some(base + 0x0E),
            ZeroPageX => Some(base + 0x16),
            AbsoluteX => Some(base + 0x1E),
            _ => None,
        }
    };

    match (mnemonic, mode) {
        (Ora, _) => alu(0x00),
        (And, _) => alu(0x20),
        (Eor, _) => alu(0x40),
        (Adc, _) => alu(0x60),
        (Lda, _) => alu(0xA0),
        (Cmp, _) => alu(0xC0),
        (Sbc, _) => alu(0xE0),
        (Sta, Immediate) => None,
        (Sta, _) => alu(0x80),

        (Asl, _) => shift(0x00),
        (Rol, _) => shift(0x20),
        (Lsr, _) => shift(0x40),
        (Ror, _) => shift(0x60),

        (Bpl, Relative) => Some(0x10),
        (Bmi, Relative) => Some(0x30),
        (Bvc, Relative) => Some(0x50),
        (Bvs, Relative) => Some(0x70),
        (Bcc, Relative) => Some(0x90),
        (Bcs, Relative) => Some(0xB0),
        (Bne, Relative) => Some(0xD0),
        (Beq, Relative) => Some(0xF0),

        (Bit, ZeroPage) => Some(0x24),
        (Bit, Absolute) => Some(0x2C),

        (Cpx, Immediate) => Some(0xE0),
        (Cpx, ZeroPage) => Some(0xE4),
        (Cpx, Absolute) => Some(0xEC),
        (Cpy, Immediate) => Some(0xC0),
        (Cpy, ZeroPage) => Some(0xC4),
        (Cpy, Absolute) => Some(0xCC),

        (Dec, ZeroPage) => Some(0xC6),
        (Dec, ZeroPageX) => Some(0xD6),
        (Dec, Absolute) => Some(0xCE),
        (Dec, AbsoluteX) => Some(0xDE),
        (Inc, ZeroPage) => Some(0xE6),
        (Inc, ZeroPageX) => Some(0xF6),
        (Inc, Absolute) => Some(0xEE),
        (Inc, AbsoluteX) => Some(0xFE),

        (Jmp, Absolute) => Some(0x4C),
        (Jmp, Indirect) => Some(0x6C),
        (Jsr, Absolute) => Some(0x20),

        (Ldx, Immediate) => Some(0xA2),
        (Ldx, ZeroPage) => Some(0xA6),
        (Ldx, ZeroPageY) => Some(0xB6),
        (Ldx, Absolute) => Some(0xAE),
        (Ldx, AbsoluteY) => Some(0xBE),
        (Ldy, Immediate) => Some(0xA0),
        (Ldy, ZeroPage) => Some(0xA4),
        (Ldy, ZeroPageX) => Some(0xB4),
        (Ldy, Absolute) => Some(0xAC),
        (Ldy, AbsoluteX) => Some(0xBC),

        (Stx, ZeroPage) => Some(0x86),
        (Stx, ZeroPageY) => Some(0x96),
        (Stx, Absolute) => Some(0x8E),
        (Sty, ZeroPage) => Some(0x84),
        (Sty, ZeroPageX) => Some(0x94),
        (Sty, Absolute) => Some(0x8C),

        (Brk, Implied) => Some(0x00),
        (Clc, Implied) => Some(0x18),
        (Cld, Implied) => Some(0xD8),
        (Cli, Implied) => Some(0x58),
        (Clv, Implied) => Some(0xB8),
        (Dex, Implied) => Some(0xCA),
        (Dey, Implied) => Some(0x88),
        (Inx, Implied) => Some(0xE8),
        (Iny, Implied) => Some(0xC8),
        (Nop, Implied) => Some(0xEA),
        (Pha, Implied) => Some(0x48),
        (Php, Implied) => Some(0x08),
        (Pla, Implied) => Some(0x68),
        (Plp, Implied) => Some(0x28),
        (Rti, Implied) => Some(0x40),
        (Rts, Implied) => Some(0x60),
        (Sec, Implied) => Some(0x38),
        (Sed, Implied) => Some(0xF8),
        (Sei, Implied) => Some(0x78),
        (Tax, Implied) => Some(0xAA),
        (Tay, Implied) => Some(0xA8),
        (Tsx, Implied) => Some(0xBA),
        (Txa, Implied) => Some(0x8A),
        (Txs, Implied) => Some(0x9A),
        (Tya, Implied) => Some(0x98),

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AddressingMode::*;
    use Mnemonic::*;

    #[test]
    fn test_lda_modes() {
        assert_eq!(opcode(Lda, Immediate), Some(0xA9));
        assert_eq!(opcode(Lda, ZeroPage), Some(0xA5));
        assert_eq!(opcode(Lda, ZeroPageX), Some(0xB5));
        assert_eq!(opcode(Lda, Absolute), Some(0xAD));
        assert_eq!(opcode(Lda, AbsoluteX), Some(0xBD));
        assert_eq!(opcode(Lda, AbsoluteY), Some(0xB9));
        assert_eq!(opcode(Lda, IndexedIndirect), Some(0xA1));
        assert_eq!(opcode(Lda, IndirectIndexed), Some(0xB1));
        assert_eq!(opcode(Lda, ZeroPageY), None);
    }

    #[test]
    fn test_sta_has_no_immediate() {
        assert_eq!(opcode(Sta, Immediate), None);
        assert_eq!(opcode(Sta, Absolute), Some(0x8D));
        assert_eq!(opcode(Sta, ZeroPage), Some(0x85));
        assert_eq!(opcode(Sta, IndirectIndexed), Some(0x91));
    }

    #[test]
    fn test_shift_group() {
        assert_eq!(opcode(Asl, Accumulator), Some(0x0A));
        assert_eq!(opcode(Ror, AbsoluteX), Some(0x7E));
        assert_eq!(opcode(Lsr, ZeroPage), Some(0x46));
        assert_eq!(opcode(Rol, Immediate), None);
    }

    #[test]
    fn test_branches_relative_only() {
        assert_eq!(opcode(Bne, Relative), Some(0xD0));
        assert_eq!(opcode(Beq, Relative), Some(0xF0));
        assert_eq!(opcode(Bcc, Absolute), None);
        assert!(Bvs.is_branch());
        assert!(!Jmp.is_branch());
    }

    #[test]
    fn test_misc() {
        assert_eq!(opcode(Jmp, Absolute), Some(0x4C));
        assert_eq!(opcode(Jmp, Indirect), Some(0x6C));
        assert_eq!(opcode(Jsr, Absolute), Some(0x20));
        assert_eq!(opcode(Rti, Implied), Some(0x40));
        assert_eq!(opcode(Ldx, ZeroPageY), Some(0xB6));
        assert_eq!(opcode(Stx, ZeroPageX), None);
        assert_eq!(opcode(Nop, Immediate), None);
    }

    #[test]
    fn test_table_is_injective() {
        let mnemonics = [
            Adc, And, Asl, Bcc, Bcs, Beq, Bit, Bmi, Bne, Bpl, Brk, Bvc, Bvs, Clc, Cld, Cli, Clv,
            Cmp, Cpx, Cpy, Dec, Dex, Dey, Eor, Inc, Inx, Iny, Jmp, Jsr, Lda, Ldx, Ldy, Lsr, Nop,
            Ora, Pha, Php, Pla, Plp, Rol, Ror, Rti, Rts, Sbc, Sec, Sed, Sei, Sta, Stx, Sty, Tax,
            Tay, Tsx, Txa, Txs, Tya,
        ];
        let modes = [
            Implied, Accumulator, Immediate, ZeroPage, ZeroPageX, ZeroPageY, Absolute, AbsoluteX,
            AbsoluteY, Indirect, IndexedIndirect, IndirectIndexed, Relative,
        ];
        let mut seen = std::collections::HashMap::new();
        for m in mnemonics {
            for mode in modes {
                if let Some(byte) = opcode(m, mode) {
                    if let Some(prev) = seen.insert(byte, (m, mode)) {
                        panic!("{:#04X} used by {:?} and {:?}", byte, prev, (m, mode));
                    }
                }
            }
        }
        assert_eq!(seen.len(), 151);
    }

    #[test]
    fn test_display() {
        assert_eq!(Lda.to_string(), "LDA");
    }
}
