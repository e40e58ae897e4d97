// This module defines JitCode, the assembled form of one procedure: the byte string, the
// int/ref/float constant pools, the number of registers per kind, the liveness table keyed
// by code offset, the offsets where instructions start and where label operands sit, and
// the resolved jump tables of switch instructions. InsnTable is the per-unit mapping
// between numeric opcodes and their "mnemonic/argcodes" shape keys interned in the
// session arena. JitCode::decode walks the byte string with that table and reproduces the
// operand sequence, resolving constant bytes back into pool entries and inline integers.

//! Assembled jitcodes and their decoder.

use super::flatten::ListOfKind;
use crate::core::{CompileError, CompileResult, Const, GcRef, Kind, Register, REGISTER_KINDS};
use hashbrown::HashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Registers live across one instruction, per kind, sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveRegs {
    pub ints: Vec<u8>,
    pub refs: Vec<u8>,
    pub floats: Vec<u8>,
}

impl LiveRegs {
    pub fn from_registers(regs: &[Register]) -> Self {
        let mut live = LiveRegs::default();
        for reg in regs {
            match reg.kind {
                Kind::Int => live.ints.push(reg.index),
                Kind::Ref => live.refs.push(reg.index),
                Kind::Float => live.floats.push(reg.index),
                Kind::Void => {}
            }
        }
        live.normalize();
        live
    }

    /// Union with `other`.
    pub fn merge(&mut self, other: &LiveRegs) {
        self.ints.extend_from_slice(&other.ints);
        self.refs.extend_from_slice(&other.refs);
        self.floats.extend_from_slice(&other.floats);
        self.normalize();
    }

    fn normalize(&mut self) {
        for list in [&mut self.ints, &mut self.refs, &mut self.floats] {
            list.sort_unstable();
            list.dedup();
        }
    }

    pub fn len(&self) -> usize {
        self.ints.len() + self.refs.len() + self.floats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolved jump table of one `switch` instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchTable {
    /// Index of the switch descriptor in the unit's descriptor list.
    pub descr: u16,
    pub targets: BTreeMap<i64, u16>,
}

/// Numeric opcode assignment of one compilation unit.
#[derive(Debug, Default)]
pub struct InsnTable<'arena> {
    by_key: HashMap<&'arena str, u8>,
    keys: Vec<&'arena str>,
}

impl<'arena> InsnTable<'arena> {
    /// Opcode of `key`, assigning the next number on first sight.
    pub fn intern(&mut self, key: &'arena str) -> CompileResult<u8> {
        if let Some(&num) = self.by_key.get(key) {
            return Ok(num);
        }
        let num = u8::try_from(self.keys.len()).map_err(|_| CompileError::TooManyOpcodes)?;
        self.by_key.insert(key, num);
        self.keys.push(key);
        Ok(num)
    }

    pub fn get(&self, key: &str) -> Option<u8> {
        self.by_key.get(key).copied()
    }

    pub fn key(&self, opcode: u8) -> Option<&'arena str> {
        self.keys.get(opcode as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// One procedure in jitcode form.
#[derive(Debug, Clone, Default)]
pub struct JitCode {
    pub name: String,
    pub code: Vec<u8>,
    pub constants_i: Vec<i64>,
    pub constants_r: Vec<GcRef>,
    pub constants_f: Vec<f64>,
    pub num_regs_i: usize,
    pub num_regs_r: usize,
    pub num_regs_f: usize,
    /// Keyed by the offset right after the instruction the entry belongs to.
    pub liveness: BTreeMap<usize, LiveRegs>,
    pub startpoints: BTreeSet<usize>,
    /// Offsets of every two-byte label operand.
    pub alllabels: BTreeSet<usize>,
    pub switch_tables: Vec<SwitchTable>,
    /// Listing kept for the first jitcodes of a unit.
    pub dump: Option<String>,
}

/// A decoded operand.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedArg {
    Reg(Register),
    Const(Const),
    Label(u16),
    List(Kind, Vec<DecodedArg>),
    Descr(u16),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedInsn {
    pub offset: usize,
    pub opname: String,
    pub args: Vec<DecodedArg>,
    pub result: Option<Register>,
}

impl JitCode {
    pub fn num_regs(&self, kind: Kind) -> usize {
        match kind {
            Kind::Int => self.num_regs_i,
            Kind::Ref => self.num_regs_r,
            Kind::Float => self.num_regs_f,
            Kind::Void => 0,
        }
    }

    pub fn num_constants(&self, kind: Kind) -> usize {
        match kind {
            Kind::Int => self.constants_i.len(),
            Kind::Ref => self.constants_r.len(),
            Kind::Float => self.constants_f.len(),
            Kind::Void => 0,
        }
    }

    /// Liveness entry for the instruction ending at `offset`.
    pub fn live_at(&self, offset: usize) -> Option<&LiveRegs> {
        self.liveness.get(&offset)
    }

    /// Decode the whole byte string.
    pub fn decode(&self, table: &InsnTable<'_>) -> CompileResult<Vec<DecodedInsn>> {
        let mut reader = Reader { code: &self.code, pos: 0, jitcode: self };
        let mut out = Vec::new();
        while reader.pos < self.code.len() {
            let offset = reader.pos;
            let opcode = reader.byte()?;
            let key = table.key(opcode).ok_or_else(|| reader.corrupt("unknown opcode"))?;
            let (opname, argcodes) = key.split_once('/').ok_or_else(|| reader.corrupt("bad key"))?;
            let mut args = Vec::new();
            let mut result = None;
            let mut codes = argcodes.chars();
            while let Some(code) = codes.next() {
                match code {
                    'i' | 'r' | 'f' => {
                        let kind = Kind::from_letter(code).unwrap_or(Kind::Int);
                        args.push(reader.reg_or_const(kind)?);
                    }
                    'c' => args.push(DecodedArg::Const(Const::Int(reader.byte()? as i8 as i64))),
                    'L' => args.push(DecodedArg::Label(reader.u16()?)),
                    'd' => args.push(DecodedArg::Descr(reader.u16()?)),
                    'I' | 'R' | 'F' => {
                        let kind = Kind::from_letter(code.to_ascii_lowercase()).unwrap_or(Kind::Int);
                        let count = reader.byte()?;
                        let items = (0..count)
                            .map(|_| reader.reg_or_const(kind))
                            .collect::<CompileResult<Vec<_>>>()?;
                        args.push(DecodedArg::List(kind, items));
                    }
                    '>' => {
                        let kind = codes
                            .next()
                            .and_then(Kind::from_letter)
                            .ok_or_else(|| reader.corrupt("bad result code"))?;
                        result = Some(Register::new(kind, reader.byte()?));
                    }
                    _ => return Err(reader.corrupt("bad argcode")),
                }
            }
            out.push(DecodedInsn {
                offset,
                opname: opname.to_string(),
                args,
                result,
            });
        }
        Ok(out)
    }
}

struct Reader<'c> {
    code: &'c [u8],
    pos: usize,
    jitcode: &'c JitCode,
}

impl Reader<'_> {
    fn corrupt(&self, what: &str) -> CompileError {
        CompileError::UnsupportedOperand {
            context: format!("decoding {} at offset {}", self.jitcode.name, self.pos),
            operand: what.to_string(),
        }
    }

    fn byte(&mut self) -> CompileResult<u8> {
        let b = *self.code.get(self.pos).ok_or_else(|| self.corrupt("truncated code"))?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> CompileResult<u16> {
        let lo = self.byte()? as u16;
        let hi = self.byte()? as u16;
        Ok(lo | (hi << 8))
    }

    fn reg_or_const(&mut self, kind: Kind) -> CompileResult<DecodedArg> {
        let b = self.byte()?;
        if (b as usize) < self.jitcode.num_regs(kind) {
            return Ok(DecodedArg::Reg(Register::new(kind, b)));
        }
        let index = 255 - b as usize;
        let constant = match kind {
            Kind::Int => self.jitcode.constants_i.get(index).map(|v| Const::Int(*v)),
            Kind::Ref => self.jitcode.constants_r.get(index).map(|v| Const::Ref(*v)),
            Kind::Float => self.jitcode.constants_f.get(index).map(|v| Const::Float(*v)),
            Kind::Void => None,
        };
        constant
            .map(DecodedArg::Const)
            .ok_or_else(|| self.corrupt("byte is neither a register nor a constant"))
    }
}

impl fmt::Display for JitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "jitcode {} ({} bytes)", self.name, self.code.len())?;
        for kind in REGISTER_KINDS {
            writeln!(
                f,
                "  {}: {} registers, {} constants",
                kind,
                self.num_regs(kind),
                self.num_constants(kind)
            )?;
        }
        let hex: Vec<String> = self.code.iter().map(|b| format!("{:02x}", b)).collect();
        writeln!(f, "  code: {}", hex.join(" "))?;
        if !self.constants_i.is_empty() {
            writeln!(f, "  constants_i: {:?}", self.constants_i)?;
        }
        if !self.constants_r.is_empty() {
            writeln!(f, "  constants_r: {:?}", self.constants_r.iter().map(|r| r.0).collect::<Vec<_>>())?;
        }
        if !self.constants_f.is_empty() {
            writeln!(f, "  constants_f: {:?}", self.constants_f)?;
        }
        for (offset, live) in &self.liveness {
            writeln!(f, "  live@{}: i{:?} r{:?} f{:?}", offset, live.ints, live.refs, live.floats)?;
        }
        Ok(())
    }
}

/// Kind letter of a list argcode.
pub fn list_argcode(list: &ListOfKind) -> char {
    list.kind.letter().to_ascii_uppercase()
}
