//! Textual form of SSA listings.
//!
//! One instruction per line: `L1:` defines a label, `-live- %i0, %r1`
//! lists live registers, and `int_add %i0, $5 -> %i1` is an operation
//! with an optional result. Operands print as `%i0` (register), `$5`,
//! `$ref:0x10`, `$2.5` (constants), a bare label name, `I[%i0, $5]`
//! (operand list) and `<call:f:ir:i>` (descriptor). `#` starts a comment.

use super::descr::Descr;
use super::flatten::{Insn, Label, ListOfKind, Operand, SsaRepr, TLabel};
use super::liveness::LIVE_MARKER;
use crate::core::{CompileError, CompileResult, Const, GcRef, Kind, Register};
use std::fmt::Write;

/// Render `ssarepr` as text.
pub fn format_assembler(ssarepr: &SsaRepr) -> String {
    let mut out = String::new();
    for insn in &ssarepr.insns {
        match insn {
            Insn::Label(label) => {
                let _ = writeln!(out, "{}:", label.0);
            }
            Insn::Live(regs) => {
                out.push_str(LIVE_MARKER);
                if !regs.is_empty() {
                    out.push(' ');
                    out.push_str(&join(regs.iter().map(|r| r.to_string())));
                }
                out.push('\n');
            }
            Insn::Op { opname, args, result } => {
                out.push_str(opname);
                if !args.is_empty() {
                    out.push(' ');
                    out.push_str(&join(args.iter().map(format_operand)));
                }
                if let Some(reg) = result {
                    let _ = write!(out, " -> {}", reg);
                }
                out.push('\n');
            }
        }
    }
    out
}

fn join(items: impl Iterator<Item = String>) -> String {
    items.collect::<Vec<_>>().join(", ")
}

fn format_operand(operand: &Operand) -> String {
    match operand {
        Operand::Reg(reg) => reg.to_string(),
        Operand::Const(c) => c.to_string(),
        Operand::TLabel(label) => label.0.clone(),
        Operand::List(list) => format!(
            "{}[{}]",
            list.kind.letter().to_ascii_uppercase(),
            join(list.items.iter().map(format_operand))
        ),
        Operand::Descr(descr) => descr.to_string(),
    }
}

/// Parse a listing produced by [`format_assembler`] or written by hand.
pub fn parse_assembler(name: &str, text: &str) -> CompileResult<SsaRepr> {
    let mut ssarepr = SsaRepr::new(name);
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let lineno = idx + 1;
        let parse_err = |reason: String| CompileError::Parse { line: lineno, reason };

        if let Some(rest) = line.strip_prefix(LIVE_MARKER) {
            let regs = split_operands(rest.trim())
                .into_iter()
                .map(|item| parse_register(item).ok_or_else(|| parse_err(format!("bad register '{}'", item))))
                .collect::<CompileResult<Vec<_>>>()?;
            ssarepr.insns.push(Insn::Live(regs));
            continue;
        }
        if let Some(label) = line.strip_suffix(':') {
            if !label.contains(char::is_whitespace) {
                ssarepr.insns.push(Insn::Label(Label(label.to_string())));
                continue;
            }
        }

        let (body, result) = match line.rsplit_once(" -> ") {
            Some((body, res)) => {
                let reg = parse_register(res.trim())
                    .ok_or_else(|| parse_err(format!("bad result register '{}'", res.trim())))?;
                (body, Some(reg))
            }
            None => (line, None),
        };
        let (opname, rest) = match body.split_once(char::is_whitespace) {
            Some((op, rest)) => (op, rest.trim()),
            None => (body, ""),
        };
        let args = split_operands(rest)
            .into_iter()
            .map(|item| parse_operand(item).map_err(parse_err))
            .collect::<CompileResult<Vec<_>>>()?;
        ssarepr.insns.push(Insn::op(opname, args, result));
    }
    Ok(ssarepr)
}

/// Split on commas outside of `[...]` and `<...>`.
fn split_operands(text: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '[' | '<' => depth += 1,
            ']' | '>' => depth -= 1,
            ',' if depth == 0 => {
                items.push(text[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = text[start..].trim();
    if !last.is_empty() {
        items.push(last);
    }
    items
}

fn parse_register(text: &str) -> Option<Register> {
    let rest = text.strip_prefix('%')?;
    let mut chars = rest.chars();
    let kind = chars.next().and_then(Kind::from_letter)?;
    let index = chars.as_str().parse().ok()?;
    Some(Register::new(kind, index))
}

fn parse_const(text: &str) -> Option<Const> {
    if let Some(hex) = text.strip_prefix("ref:") {
        let digits = hex.strip_prefix("0x").unwrap_or(hex);
        return usize::from_str_radix(digits, 16).ok().map(|v| Const::Ref(GcRef(v)));
    }
    let is_float = text.contains(['.', 'e']) || text.contains("NaN") || text.contains("inf");
    if is_float {
        text.parse().ok().map(Const::Float)
    } else {
        text.parse().ok().map(Const::Int)
    }
}

fn parse_operand(text: &str) -> Result<Operand, String> {
    if text.starts_with('%') {
        return parse_register(text)
            .map(Operand::Reg)
            .ok_or_else(|| format!("bad register '{}'", text));
    }
    if let Some(rest) = text.strip_prefix('$') {
        return parse_const(rest)
            .map(Operand::Const)
            .ok_or_else(|| format!("bad constant '{}'", text));
    }
    if text.starts_with('<') {
        return text
            .parse::<Descr>()
            .map(Operand::Descr)
            .map_err(|e| e.to_string());
    }
    if let Some(inner) = text.strip_suffix(']') {
        let mut chars = inner.chars();
        let kind = chars
            .next()
            .filter(|c| c.is_ascii_uppercase())
            .and_then(|c| Kind::from_letter(c.to_ascii_lowercase()));
        let items = chars.as_str().strip_prefix('[');
        if let (Some(kind), Some(items)) = (kind, items) {
            let items = split_operands(items)
                .into_iter()
                .map(parse_operand)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Operand::List(ListOfKind { kind, items }));
        }
        return Err(format!("bad operand list '{}'", text));
    }
    if !text.is_empty() && text.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Ok(Operand::TLabel(TLabel(text.to_string())));
    }
    Err(format!("unrecognised operand '{}'", text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codewriter::descr::CallDescr;

    #[test]
    fn test_format_listing() {
        let mut ssa = SsaRepr::new("f");
        ssa.insns.push(Insn::Label(Label("L1".into())));
        ssa.insns.push(Insn::Live(vec![Register::new(Kind::Int, 0), Register::new(Kind::Ref, 1)]));
        ssa.insns.push(Insn::op(
            "residual_call_ir_i",
            vec![
                Operand::Descr(Descr::Call(CallDescr {
                    name: "g".into(),
                    arg_kinds: vec![Kind::Int, Kind::Ref],
                    result: Kind::Int,
                })),
                Operand::List(ListOfKind {
                    kind: Kind::Int,
                    items: vec![Operand::Reg(Register::new(Kind::Int, 0)), Operand::Const(Const::Int(5))],
                }),
                Operand::List(ListOfKind { kind: Kind::Ref, items: vec![] }),
            ],
            Some(Register::new(Kind::Int, 2)),
        ));
        ssa.insns.push(Insn::op("goto", vec![Operand::TLabel(TLabel("L1".into()))], None));

        let text = format_assembler(&ssa);
        assert_eq!(
            text,
            "L1:\n-live- %i0, %r1\nresidual_call_ir_i <call:g:ir:i>, I[%i0, $5], R[] -> %i2\ngoto L1\n"
        );
        assert_eq!(parse_assembler("f", &text).unwrap(), ssa);
    }

    #[test]
    fn test_parse_constants_and_comments() {
        let text = "# header\nfloat_add %f0, $2.5 -> %f1  # sum\nref_return $ref:0x40\nint_return $-3\n";
        let ssa = parse_assembler("g", text).unwrap();
        assert_eq!(ssa.insns.len(), 3);
        assert_eq!(
            ssa.insns[0],
            Insn::op(
                "float_add",
                vec![Operand::Reg(Register::new(Kind::Float, 0)), Operand::Const(Const::Float(2.5))],
                Some(Register::new(Kind::Float, 1))
            )
        );
        assert_eq!(ssa.insns[1], Insn::op("ref_return", vec![Operand::Const(Const::Ref(GcRef(0x40)))], None));
        assert_eq!(ssa.insns[2], Insn::op("int_return", vec![Operand::Const(Const::Int(-3))], None));
    }

    #[test]
    fn test_parse_error_reports_line() {
        let err = parse_assembler("h", "void_return\nint_copy %x0 -> %i0\n").unwrap_err();
        assert!(matches!(err, CompileError::Parse { line: 2, .. }));
    }
}
