// SPDX-License-Identifier: AGPL-3.0

//! Bytecode decoding and the program model.
//!
//! A hex string of runtime bytecode is disassembled into an indexed
//! sequence of instructions with PUSH immediates attached, alongside the
//! raw code bytes (kept for CODECOPY). Source-map entries are decoded
//! from the compiler's colon-separated format and attached per
//! instruction index.

use std::collections::{HashMap, HashSet};

use symx_errors::{SymxError, SymxResult};

// EVM opcodes
pub const OP_STOP: u8 = 0x00;
pub const OP_ADD: u8 = 0x01;
pub const OP_MUL: u8 = 0x02;
pub const OP_SUB: u8 = 0x03;
pub const OP_DIV: u8 = 0x04;
pub const OP_SDIV: u8 = 0x05;
pub const OP_MOD: u8 = 0x06;
pub const OP_SMOD: u8 = 0x07;
pub const OP_ADDMOD: u8 = 0x08;
pub const OP_MULMOD: u8 = 0x09;
pub const OP_EXP: u8 = 0x0A;
pub const OP_SIGNEXTEND: u8 = 0x0B;
pub const OP_LT: u8 = 0x10;
pub const OP_GT: u8 = 0x11;
pub const OP_SLT: u8 = 0x12;
pub const OP_SGT: u8 = 0x13;
pub const OP_EQ: u8 = 0x14;
pub const OP_ISZERO: u8 = 0x15;
pub const OP_AND: u8 = 0x16;
pub const OP_OR: u8 = 0x17;
pub const OP_XOR: u8 = 0x18;
pub const OP_NOT: u8 = 0x19;
pub const OP_BYTE: u8 = 0x1A;
pub const OP_SHL: u8 = 0x1B;
pub const OP_SHR: u8 = 0x1C;
pub const OP_SAR: u8 = 0x1D;
pub const OP_SHA3: u8 = 0x20;
pub const OP_ADDRESS: u8 = 0x30;
pub const OP_BALANCE: u8 = 0x31;
pub const OP_ORIGIN: u8 = 0x32;
pub const OP_CALLER: u8 = 0x33;
pub const OP_CALLVALUE: u8 = 0x34;
pub const OP_CALLDATALOAD: u8 = 0x35;
pub const OP_CALLDATASIZE: u8 = 0x36;
pub const OP_CALLDATACOPY: u8 = 0x37;
pub const OP_CODESIZE: u8 = 0x38;
pub const OP_CODECOPY: u8 = 0x39;
pub const OP_GASPRICE: u8 = 0x3A;
pub const OP_EXTCODESIZE: u8 = 0x3B;
pub const OP_EXTCODECOPY: u8 = 0x3C;
pub const OP_RETURNDATASIZE: u8 = 0x3D;
pub const OP_RETURNDATACOPY: u8 = 0x3E;
pub const OP_EXTCODEHASH: u8 = 0x3F;
pub const OP_BLOCKHASH: u8 = 0x40;
pub const OP_COINBASE: u8 = 0x41;
pub const OP_TIMESTAMP: u8 = 0x42;
pub const OP_NUMBER: u8 = 0x43;
pub const OP_DIFFICULTY: u8 = 0x44;
pub const OP_GASLIMIT: u8 = 0x45;
pub const OP_CHAINID: u8 = 0x46;
pub const OP_SELFBALANCE: u8 = 0x47;
pub const OP_BASEFEE: u8 = 0x48;
pub const OP_POP: u8 = 0x50;
pub const OP_MLOAD: u8 = 0x51;
pub const OP_MSTORE: u8 = 0x52;
pub const OP_MSTORE8: u8 = 0x53;
pub const OP_SLOAD: u8 = 0x54;
pub const OP_SSTORE: u8 = 0x55;
pub const OP_JUMP: u8 = 0x56;
pub const OP_JUMPI: u8 = 0x57;
pub const OP_PC: u8 = 0x58;
pub const OP_MSIZE: u8 = 0x59;
pub const OP_GAS: u8 = 0x5A;
pub const OP_JUMPDEST: u8 = 0x5B;
pub const OP_PUSH0: u8 = 0x5F;
pub const OP_PUSH1: u8 = 0x60;
pub const OP_PUSH32: u8 = 0x7F;
pub const OP_DUP1: u8 = 0x80;
pub const OP_DUP16: u8 = 0x8F;
pub const OP_SWAP1: u8 = 0x90;
pub const OP_SWAP16: u8 = 0x9F;
pub const OP_LOG0: u8 = 0xA0;
pub const OP_LOG4: u8 = 0xA4;
pub const OP_CREATE: u8 = 0xF0;
pub const OP_CALL: u8 = 0xF1;
pub const OP_CALLCODE: u8 = 0xF2;
pub const OP_RETURN: u8 = 0xF3;
pub const OP_DELEGATECALL: u8 = 0xF4;
pub const OP_CREATE2: u8 = 0xF5;
pub const OP_STATICCALL: u8 = 0xFA;
pub const OP_REVERT: u8 = 0xFD;
pub const OP_INVALID: u8 = 0xFE;
pub const OP_SELFDESTRUCT: u8 = 0xFF;

/// Length in bytes of the instruction with the given opcode.
pub fn insn_len(opcode: u8) -> usize {
    if (OP_PUSH1..=OP_PUSH32).contains(&opcode) {
        1 + (opcode - OP_PUSH0) as usize
    } else {
        1
    }
}

/// Human-readable mnemonic.
pub fn mnemonic(opcode: u8) -> String {
    match opcode {
        OP_STOP => "STOP".to_string(),
        OP_ADD => "ADD".to_string(),
        OP_MUL => "MUL".to_string(),
        OP_SUB => "SUB".to_string(),
        OP_DIV => "DIV".to_string(),
        OP_SDIV => "SDIV".to_string(),
        OP_MOD => "MOD".to_string(),
        OP_SMOD => "SMOD".to_string(),
        OP_ADDMOD => "ADDMOD".to_string(),
        OP_MULMOD => "MULMOD".to_string(),
        OP_EXP => "EXP".to_string(),
        OP_SIGNEXTEND => "SIGNEXTEND".to_string(),
        OP_LT => "LT".to_string(),
        OP_GT => "GT".to_string(),
        OP_SLT => "SLT".to_string(),
        OP_SGT => "SGT".to_string(),
        OP_EQ => "EQ".to_string(),
        OP_ISZERO => "ISZERO".to_string(),
        OP_AND => "AND".to_string(),
        OP_OR => "OR".to_string(),
        OP_XOR => "XOR".to_string(),
        OP_NOT => "NOT".to_string(),
        OP_BYTE => "BYTE".to_string(),
        OP_SHL => "SHL".to_string(),
        OP_SHR => "SHR".to_string(),
        OP_SAR => "SAR".to_string(),
        OP_SHA3 => "SHA3".to_string(),
        OP_ADDRESS => "ADDRESS".to_string(),
        OP_BALANCE => "BALANCE".to_string(),
        OP_ORIGIN => "ORIGIN".to_string(),
        OP_CALLER => "CALLER".to_string(),
        OP_CALLVALUE => "CALLVALUE".to_string(),
        OP_CALLDATALOAD => "CALLDATALOAD".to_string(),
        OP_CALLDATASIZE => "CALLDATASIZE".to_string(),
        OP_CALLDATACOPY => "CALLDATACOPY".to_string(),
        OP_CODESIZE => "CODESIZE".to_string(),
        OP_CODECOPY => "CODECOPY".to_string(),
        OP_GASPRICE => "GASPRICE".to_string(),
        OP_EXTCODESIZE => "EXTCODESIZE".to_string(),
        OP_EXTCODECOPY => "EXTCODECOPY".to_string(),
        OP_RETURNDATASIZE => "RETURNDATASIZE".to_string(),
        OP_RETURNDATACOPY => "RETURNDATACOPY".to_string(),
        OP_EXTCODEHASH => "EXTCODEHASH".to_string(),
        OP_BLOCKHASH => "BLOCKHASH".to_string(),
        OP_COINBASE => "COINBASE".to_string(),
        OP_TIMESTAMP => "TIMESTAMP".to_string(),
        OP_NUMBER => "NUMBER".to_string(),
        OP_DIFFICULTY => "DIFFICULTY".to_string(),
        OP_GASLIMIT => "GASLIMIT".to_string(),
        OP_CHAINID => "CHAINID".to_string(),
        OP_SELFBALANCE => "SELFBALANCE".to_string(),
        OP_BASEFEE => "BASEFEE".to_string(),
        OP_POP => "POP".to_string(),
        OP_MLOAD => "MLOAD".to_string(),
        OP_MSTORE => "MSTORE".to_string(),
        OP_MSTORE8 => "MSTORE8".to_string(),
        OP_SLOAD => "SLOAD".to_string(),
        OP_SSTORE => "SSTORE".to_string(),
        OP_JUMP => "JUMP".to_string(),
        OP_JUMPI => "JUMPI".to_string(),
        OP_PC => "PC".to_string(),
        OP_MSIZE => "MSIZE".to_string(),
        OP_GAS => "GAS".to_string(),
        OP_JUMPDEST => "JUMPDEST".to_string(),
        OP_PUSH0 => "PUSH0".to_string(),
        n @ OP_PUSH1..=OP_PUSH32 => format!("PUSH{}", n - OP_PUSH0),
        n @ OP_DUP1..=OP_DUP16 => format!("DUP{}", n - OP_DUP1 + 1),
        n @ OP_SWAP1..=OP_SWAP16 => format!("SWAP{}", n - OP_SWAP1 + 1),
        n @ OP_LOG0..=OP_LOG4 => format!("LOG{}", n - OP_LOG0),
        OP_CREATE => "CREATE".to_string(),
        OP_CALL => "CALL".to_string(),
        OP_CALLCODE => "CALLCODE".to_string(),
        OP_RETURN => "RETURN".to_string(),
        OP_DELEGATECALL => "DELEGATECALL".to_string(),
        OP_CREATE2 => "CREATE2".to_string(),
        OP_STATICCALL => "STATICCALL".to_string(),
        OP_REVERT => "REVERT".to_string(),
        OP_INVALID => "INVALID".to_string(),
        OP_SELFDESTRUCT => "SELFDESTRUCT".to_string(),
        _ => format!("0x{:02x}", opcode),
    }
}

/// One decoded source-map entry: (start, length, file id, jump kind,
/// modifier depth), with the compiler's inherit-previous-on-empty rule
/// already applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SrcMap {
    pub start: i64,
    pub length: i64,
    pub file_id: i64,
    pub jump: char,
    pub modifier_depth: i64,
}

impl Default for SrcMap {
    fn default() -> Self {
        Self {
            start: 0,
            length: 0,
            file_id: 0,
            jump: '-',
            modifier_depth: 0,
        }
    }
}

/// Decode a semicolon-separated source map string into per-instruction
/// entries.
pub fn parse_srcmap(srcmap: &str) -> Vec<SrcMap> {
    let mut entries = Vec::new();
    let mut current = SrcMap::default();

    if srcmap.is_empty() {
        return entries;
    }

    for item in srcmap.split(';') {
        let fields: Vec<&str> = item.split(':').collect();

        let field = |i: usize| fields.get(i).copied().unwrap_or("");
        if let Ok(v) = field(0).parse() {
            current.start = v;
        }
        if let Ok(v) = field(1).parse() {
            current.length = v;
        }
        if let Ok(v) = field(2).parse() {
            current.file_id = v;
        }
        if let Some(c) = field(3).chars().next() {
            current.jump = c;
        }
        if let Ok(v) = field(4).parse() {
            current.modifier_depth = v;
        }

        entries.push(current.clone());
    }

    entries
}

/// A single decoded instruction.
#[derive(Clone, Debug)]
pub struct Instruction {
    pub opcode: u8,
    pub pc: usize,
    pub next_pc: usize,
    /// PUSH immediate, big-endian.
    pub operand: Option<Vec<u8>>,
    pub srcmap: Option<SrcMap>,
}

impl Instruction {
    pub fn mnemonic(&self) -> String {
        mnemonic(self.opcode)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.opcode, OP_STOP | OP_RETURN | OP_REVERT | OP_INVALID)
    }
}

/// A decoded program: the instruction sequence, the opcode-at-pc view
/// used for dispatch, and the raw code bytes used for CODECOPY.
#[derive(Debug)]
pub struct Program {
    code: Vec<u8>,
    insns: Vec<Instruction>,
    by_pc: HashMap<usize, usize>,
    jumpdests: HashSet<usize>,
}

impl Program {
    /// Disassemble an even-length hex string (an optional `0x` prefix is
    /// tolerated). Unknown bytes decode to INVALID; a PUSH whose
    /// immediate runs past the end of the code decodes to INVALID.
    pub fn decode(hexcode: &str) -> SymxResult<Program> {
        let stripped = hexcode.trim().trim_start_matches("0x");
        if stripped.len() % 2 != 0 {
            return Err(SymxError::Artifact(format!(
                "odd-length hexcode ({} digits)",
                stripped.len()
            )));
        }
        if stripped.contains("__") {
            symx_logs::warn_unique("hexcode contains an unresolved library placeholder");
        }

        let code = hex::decode(stripped)
            .map_err(|e| SymxError::Artifact(format!("invalid hexcode: {}", e)))?;

        let mut insns = Vec::new();
        let mut by_pc = HashMap::new();
        let mut jumpdests = HashSet::new();

        let mut pc = 0;
        while pc < code.len() {
            let opcode = code[pc];
            let len = insn_len(opcode);

            let insn = if len > 1 && pc + len > code.len() {
                // truncated PUSH immediate
                Instruction {
                    opcode: OP_INVALID,
                    pc,
                    next_pc: code.len(),
                    operand: None,
                    srcmap: None,
                }
            } else {
                if opcode == OP_JUMPDEST {
                    jumpdests.insert(pc);
                }
                Instruction {
                    opcode,
                    pc,
                    next_pc: pc + len,
                    operand: (len > 1).then(|| code[pc + 1..pc + len].to_vec()),
                    srcmap: None,
                }
            };

            by_pc.insert(pc, insns.len());
            let next = insn.next_pc;
            insns.push(insn);
            pc = next;
        }

        Ok(Program {
            code,
            insns,
            by_pc,
            jumpdests,
        })
    }

    /// Attach one source-map entry per instruction index.
    pub fn attach_srcmap(&mut self, srcmap: &str) {
        for (insn, entry) in self.insns.iter_mut().zip(parse_srcmap(srcmap)) {
            insn.srcmap = Some(entry);
        }
    }

    /// The instruction starting at the given pc, if any.
    pub fn insn_at(&self, pc: usize) -> Option<&Instruction> {
        self.by_pc.get(&pc).map(|&i| &self.insns[i])
    }

    /// The opcode dispatched at the given pc; positions past the end of
    /// the code behave as STOP.
    pub fn op_at(&self, pc: usize) -> u8 {
        if pc >= self.code.len() {
            return OP_STOP;
        }
        self.insn_at(pc).map(|i| i.opcode).unwrap_or(OP_INVALID)
    }

    pub fn is_jumpdest(&self, pc: usize) -> bool {
        self.jumpdests.contains(&pc)
    }

    /// Raw code byte, zero beyond the end (EVM CODECOPY rule).
    pub fn code_byte(&self, offset: usize) -> u8 {
        self.code.get(offset).copied().unwrap_or(0)
    }

    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn insns(&self) -> &[Instruction] {
        &self.insns
    }

    /// Re-emit the byte stream from the decoded instructions. For
    /// well-formed code this is the identity on the input bytes.
    pub fn reassemble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.code.len());
        for insn in &self.insns {
            out.push(self.code[insn.pc]);
            if let Some(operand) = &insn.operand {
                out.extend_from_slice(operand);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insn_len() {
        assert_eq!(insn_len(OP_STOP), 1);
        assert_eq!(insn_len(OP_PUSH1), 2);
        assert_eq!(insn_len(OP_PUSH32), 33);
        assert_eq!(insn_len(OP_DUP1), 1);
    }

    #[test]
    fn test_mnemonics() {
        assert_eq!(mnemonic(OP_ADD), "ADD");
        assert_eq!(mnemonic(OP_PUSH1), "PUSH1");
        assert_eq!(mnemonic(OP_DUP16), "DUP16");
        assert_eq!(mnemonic(0x92), "SWAP3");
        assert_eq!(mnemonic(0xEF), "0xef");
    }

    #[test]
    fn test_decode_simple() {
        // PUSH1 0x80 PUSH1 0x40 MSTORE
        let pgm = Program::decode("6080604052").unwrap();
        assert_eq!(pgm.insns().len(), 3);
        assert_eq!(pgm.op_at(0), OP_PUSH1);
        assert_eq!(pgm.insn_at(0).unwrap().operand, Some(vec![0x80]));
        assert_eq!(pgm.op_at(2), OP_PUSH1);
        assert_eq!(pgm.op_at(4), OP_MSTORE);
        // inside an immediate there is no instruction
        assert!(pgm.insn_at(1).is_none());
    }

    #[test]
    fn test_decode_0x_prefix() {
        let pgm = Program::decode("0x6001").unwrap();
        assert_eq!(pgm.op_at(0), OP_PUSH1);
    }

    #[test]
    fn test_decode_odd_length_rejected() {
        assert!(Program::decode("608").is_err());
    }

    #[test]
    fn test_truncated_push_becomes_invalid() {
        // PUSH2 with a single immediate byte
        let pgm = Program::decode("6101").unwrap();
        assert_eq!(pgm.op_at(0), OP_INVALID);
    }

    #[test]
    fn test_unknown_opcode_is_invalid_mnemonic() {
        let pgm = Program::decode("0c").unwrap();
        assert_eq!(pgm.op_at(0), 0x0c);
        assert_eq!(pgm.insn_at(0).unwrap().mnemonic(), "0x0c");
    }

    #[test]
    fn test_past_end_is_stop() {
        let pgm = Program::decode("6001").unwrap();
        assert_eq!(pgm.op_at(100), OP_STOP);
    }

    #[test]
    fn test_jumpdests_skip_immediates() {
        // PUSH1 0x5b JUMPDEST: the 0x5b inside the immediate is data
        let pgm = Program::decode("605b5b").unwrap();
        assert!(!pgm.is_jumpdest(1));
        assert!(pgm.is_jumpdest(2));
    }

    #[test]
    fn test_reassemble_roundtrip() {
        let hexcode = "60806040526004361061001057600080fd5b";
        let pgm = Program::decode(hexcode).unwrap();
        assert_eq!(pgm.reassemble(), hex::decode(hexcode).unwrap());
    }

    #[test]
    fn test_srcmap_inheritance() {
        let entries = parse_srcmap("0:10:0:-:0;;:20;5::1:i");
        assert_eq!(entries.len(), 4);
        // second entry inherits everything
        assert_eq!(entries[1], entries[0]);
        // third overrides the length only
        assert_eq!(entries[2].start, 0);
        assert_eq!(entries[2].length, 20);
        // fourth overrides start, file id, and jump kind
        assert_eq!(entries[3].start, 5);
        assert_eq!(entries[3].length, 20);
        assert_eq!(entries[3].file_id, 1);
        assert_eq!(entries[3].jump, 'i');
    }

    #[test]
    fn test_srcmap_attach() {
        let mut pgm = Program::decode("6080604052").unwrap();
        pgm.attach_srcmap("0:5:0:-:0;6:2;8:1");
        assert_eq!(pgm.insn_at(0).unwrap().srcmap.as_ref().unwrap().start, 0);
        assert_eq!(pgm.insn_at(2).unwrap().srcmap.as_ref().unwrap().start, 6);
        assert_eq!(pgm.insn_at(4).unwrap().srcmap.as_ref().unwrap().start, 8);
    }
}
