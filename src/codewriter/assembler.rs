// This module implements the Assembler that encodes flattened SSA listings into jitcodes.
// Every operand takes one byte except labels and descriptors (two little-endian bytes) and
// lists (a count byte followed by the items). A register is its slot index; a constant is
// `256 - pool_length` after appending it to the pool of its kind, so pool entries count
// down from 255 and never collide with register indices as long as registers plus constants
// of a kind stay within 256, which is checked once the jitcode is complete. Integers in
// [-128, 127] outside lists are inlined as a signed byte with argcode 'c' and never take a
// pool slot. The opcode of an instruction is the interned "mnemonic/argcodes" key, numbered
// in first-seen order per compilation unit; the descriptor list is shared by the unit too.
// `-live-` markers are not emitted: they merge into the liveness table under the offset
// right after the following instruction. `keepalive` is dropped. Label operands are
// written as placeholders and patched once every label position is known.

//! Jitcode assembler.

use super::descr::{Descr, SwitchDescr};
use super::flatten::{Insn, ListOfKind, Operand, SsaRepr};
use super::format::format_assembler;
use super::jitcode::{list_argcode, InsnTable, JitCode, LiveRegs, SwitchTable};
use crate::core::{CompilationSession, CompileError, CompileResult, Const, GcRef, Kind, Register};
use hashbrown::HashMap;
use std::collections::{BTreeMap, BTreeSet};

/// Number of jitcodes per unit that keep a textual dump.
const MAX_DUMPED_JITCODES: usize = 20;

/// Encodes listings into jitcodes, sharing opcodes and descriptors across a unit.
pub struct Assembler<'s, 'arena> {
    session: &'s CompilationSession<'arena>,
    insns: InsnTable<'arena>,
    descrs: Vec<Descr>,
    descr_index: HashMap<Descr, u16>,
    count_jitcodes: usize,
}

impl<'s, 'arena> Assembler<'s, 'arena> {
    pub fn new(session: &'s CompilationSession<'arena>) -> Self {
        Self {
            session,
            insns: InsnTable::default(),
            descrs: Vec::new(),
            descr_index: HashMap::new(),
            count_jitcodes: 0,
        }
    }

    /// Opcode numbering of this unit.
    pub fn insns(&self) -> &InsnTable<'arena> {
        &self.insns
    }

    /// Descriptors referenced so far, by index.
    pub fn descrs(&self) -> &[Descr] {
        &self.descrs
    }

    /// Encode `ssarepr` into a new jitcode.
    pub fn assemble(&mut self, ssarepr: &SsaRepr) -> CompileResult<JitCode> {
        let mut state = AssemblyState::default();
        for insn in &ssarepr.insns {
            self.write_insn(&mut state, insn)?;
        }
        if state.nextlive.is_some() {
            log::debug!("{}: trailing -live- marker without an instruction", ssarepr.name);
        }
        state.fix_labels()?;
        state.check_result()?;

        let dump = (self.count_jitcodes < MAX_DUMPED_JITCODES).then(|| format_assembler(ssarepr));
        self.count_jitcodes += 1;
        self.session
            .record_jitcode_assembled(&ssarepr.name, state.code.len(), state.liveness.len());
        log::debug!(
            "assembled {}: {} bytes, {} opcodes in unit",
            ssarepr.name,
            state.code.len(),
            self.insns.len()
        );

        Ok(JitCode {
            name: ssarepr.name.clone(),
            code: state.code,
            constants_i: state.constants_i,
            constants_r: state.constants_r,
            constants_f: state.constants_f,
            num_regs_i: state.count_regs[0],
            num_regs_r: state.count_regs[1],
            num_regs_f: state.count_regs[2],
            liveness: state.liveness,
            startpoints: state.startpoints,
            alllabels: state.alllabels,
            switch_tables: state.switch_tables,
            dump,
        })
    }

    fn write_insn(&mut self, state: &mut AssemblyState, insn: &Insn) -> CompileResult<()> {
        let (opname, args, result) = match insn {
            Insn::Label(label) => {
                state.label_positions.insert(label.0.clone(), state.code.len());
                return Ok(());
            }
            Insn::Live(regs) => {
                let live = LiveRegs::from_registers(regs);
                match &mut state.nextlive {
                    Some(pending) => pending.merge(&live),
                    None => state.nextlive = Some(live),
                }
                return Ok(());
            }
            Insn::Op { opname, .. } if opname == "keepalive" => return Ok(()),
            Insn::Op { opname, args, result } => (opname, args, result),
        };

        let startposition = state.code.len();
        state.code.push(0);
        let mut argcodes = String::new();
        for arg in args {
            match arg {
                Operand::Reg(reg) => {
                    state.emit_reg(*reg)?;
                    argcodes.push(reg.kind.letter());
                }
                Operand::Const(c) => {
                    if self.emit_const(state, *c, c.kind(), true)? {
                        argcodes.push('c');
                    } else {
                        argcodes.push(c.kind().letter());
                    }
                }
                Operand::TLabel(label) => {
                    state.alllabels.insert(state.code.len());
                    state.tlabel_positions.push((label.0.clone(), state.code.len()));
                    state.code.extend_from_slice(&[0, 0]);
                    argcodes.push('L');
                }
                Operand::List(list) => {
                    self.emit_list(state, list)?;
                    argcodes.push(list_argcode(list));
                }
                Operand::Descr(descr) => {
                    let num = self.descr_number(descr)?;
                    if let Descr::Switch(switch) = descr {
                        state.switches.push((num, switch.clone()));
                    }
                    state.code.extend_from_slice(&num.to_le_bytes());
                    argcodes.push('d');
                }
            }
        }
        if let Some(reg) = result {
            argcodes.push('>');
            argcodes.push(reg.kind.letter());
            state.emit_reg(*reg)?;
        }

        let key = format!("{}/{}", opname, argcodes);
        let key = self.session.intern_str(&key);
        let num = self.insns.intern(key)?;
        state.code[startposition] = num;
        state.startpoints.insert(startposition);
        self.session.record_instruction_assembled(key);
        log::trace!("{:5} {}", startposition, key);

        if let Some(live) = state.nextlive.take() {
            let end = state.code.len();
            match state.liveness.get_mut(&end) {
                Some(existing) => existing.merge(&live),
                None => {
                    state.liveness.insert(end, live);
                }
            }
        }
        Ok(())
    }

    /// Emit a constant; returns whether it was inlined as a short integer.
    fn emit_const(
        &mut self,
        state: &mut AssemblyState,
        c: Const,
        kind: Kind,
        allow_short: bool,
    ) -> CompileResult<bool> {
        if c.kind() != kind {
            return Err(CompileError::KindMismatch {
                expected: kind,
                found: c.kind(),
            });
        }
        if allow_short {
            if let Some(short) = c.short_int() {
                state.code.push(short as u8);
                self.session.record_constant_inlined();
                return Ok(true);
            }
        }
        let byte = match state.constants_dict.get(&c) {
            Some(&byte) => byte,
            None => {
                let len = match c {
                    Const::Int(v) => push_constant(&mut state.constants_i, v),
                    Const::Ref(r) => push_constant(&mut state.constants_r, r),
                    Const::Float(v) => push_constant(&mut state.constants_f, v),
                };
                if len > 256 {
                    return Err(CompileError::EncodingOverflow {
                        kind,
                        registers: state.count_regs[bank(kind)],
                        constants: len,
                    });
                }
                let byte = (256 - len) as u8;
                state.constants_dict.insert(c, byte);
                self.session.record_constant_pooled();
                byte
            }
        };
        state.code.push(byte);
        Ok(false)
    }

    fn emit_list(&mut self, state: &mut AssemblyState, list: &ListOfKind) -> CompileResult<()> {
        let len = u8::try_from(list.items.len()).map_err(|_| CompileError::ListTooLong {
            len: list.items.len(),
        })?;
        state.code.push(len);
        for item in &list.items {
            match item {
                Operand::Reg(reg) => {
                    if reg.kind != list.kind {
                        return Err(CompileError::KindMismatch {
                            expected: list.kind,
                            found: reg.kind,
                        });
                    }
                    state.emit_reg(*reg)?;
                }
                Operand::Const(c) => {
                    self.emit_const(state, *c, list.kind, false)?;
                }
                other => {
                    return Err(CompileError::UnsupportedOperand {
                        context: "operand list".into(),
                        operand: format!("{:?}", other),
                    })
                }
            }
        }
        Ok(())
    }

    fn descr_number(&mut self, descr: &Descr) -> CompileResult<u16> {
        if let Some(&num) = self.descr_index.get(descr) {
            return Ok(num);
        }
        let num = u16::try_from(self.descrs.len()).map_err(|_| CompileError::TooManyDescrs)?;
        self.descrs.push(descr.clone());
        self.descr_index.insert(descr.clone(), num);
        Ok(num)
    }
}

fn bank(kind: Kind) -> usize {
    kind.bank().unwrap_or(0)
}

/// Append `value` and return the new pool length; the constant's byte is `256 - len`.
fn push_constant<T>(pool: &mut Vec<T>, value: T) -> usize {
    pool.push(value);
    pool.len()
}

/// Per-jitcode assembly state.
#[derive(Default)]
struct AssemblyState {
    code: Vec<u8>,
    constants_dict: HashMap<Const, u8>,
    constants_i: Vec<i64>,
    constants_r: Vec<GcRef>,
    constants_f: Vec<f64>,
    label_positions: HashMap<String, usize>,
    tlabel_positions: Vec<(String, usize)>,
    switches: Vec<(u16, SwitchDescr)>,
    switch_tables: Vec<SwitchTable>,
    count_regs: [usize; 3],
    liveness: BTreeMap<usize, LiveRegs>,
    nextlive: Option<LiveRegs>,
    startpoints: BTreeSet<usize>,
    alllabels: BTreeSet<usize>,
}

impl AssemblyState {
    fn emit_reg(&mut self, reg: Register) -> CompileResult<()> {
        let bank = reg.kind.bank().ok_or(CompileError::UnsupportedOperand {
            context: "register".into(),
            operand: reg.to_string(),
        })?;
        if reg.index as usize >= self.count_regs[bank] {
            self.count_regs[bank] = reg.index as usize + 1;
        }
        self.code.push(reg.index);
        Ok(())
    }

    fn label_target(&self, name: &str) -> CompileResult<u16> {
        let target = *self
            .label_positions
            .get(name)
            .ok_or_else(|| CompileError::UnresolvedLabel { name: name.to_string() })?;
        u16::try_from(target).map_err(|_| CompileError::LabelOutOfRange {
            name: name.to_string(),
            offset: target,
        })
    }

    fn fix_labels(&mut self) -> CompileResult<()> {
        for (name, pos) in &self.tlabel_positions {
            let target = self.label_target(name)?;
            self.code[*pos..*pos + 2].copy_from_slice(&target.to_le_bytes());
        }
        for (num, switch) in &self.switches {
            let targets = switch
                .cases
                .iter()
                .map(|(value, label)| Ok((*value, self.label_target(label)?)))
                .collect::<CompileResult<BTreeMap<_, _>>>()?;
            self.switch_tables.push(SwitchTable { descr: *num, targets });
        }
        Ok(())
    }

    fn check_result(&self) -> CompileResult<()> {
        let pools = [self.constants_i.len(), self.constants_r.len(), self.constants_f.len()];
        for (kind, (registers, constants)) in crate::core::REGISTER_KINDS
            .into_iter()
            .zip(self.count_regs.into_iter().zip(pools))
        {
            if registers + constants > 256 {
                return Err(CompileError::EncodingOverflow {
                    kind,
                    registers,
                    constants,
                });
            }
        }
        Ok(())
    }
}
