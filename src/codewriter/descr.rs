//! Descriptors referenced from jitcode instructions.
//!
//! A descriptor is encoded as a two-byte index into the descriptor list
//! shared by every jitcode of a compilation unit. Descriptors are interned
//! by value, so two equal call descriptors share one index. Switch
//! descriptors carry a per-unit id to keep distinct switches apart.

use crate::core::{CompileError, CompileResult, Kind};
use std::fmt;
use std::str::FromStr;

/// Identity of a jitcode inside one codewriter run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JitCodeId(pub u32);

/// A separately compiled callee.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallDescr {
    pub name: String,
    pub arg_kinds: Vec<Kind>,
    pub result: Kind,
}

/// A field of a GC object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldDescr {
    pub owner: String,
    pub name: String,
    pub kind: Kind,
}

/// Jump table of a `switch` instruction: case value to label name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SwitchDescr {
    pub id: u32,
    pub cases: Vec<(i64, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Descr {
    JitCode(JitCodeId),
    Call(CallDescr),
    Field(FieldDescr),
    Switch(SwitchDescr),
}

fn kinds_to_string(kinds: &[Kind]) -> String {
    kinds.iter().map(|k| k.letter()).collect()
}

impl fmt::Display for Descr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Descr::JitCode(id) => write!(f, "<jitcode:{}>", id.0),
            Descr::Call(call) => write!(
                f,
                "<call:{}:{}:{}>",
                call.name,
                kinds_to_string(&call.arg_kinds),
                call.result.letter()
            ),
            Descr::Field(field) => write!(
                f,
                "<field:{}.{}:{}>",
                field.owner,
                field.name,
                field.kind.letter()
            ),
            Descr::Switch(switch) => {
                write!(f, "<switch:{}:", switch.id)?;
                for (i, (value, label)) in switch.cases.iter().enumerate() {
                    if i > 0 {
                        f.write_str(";")?;
                    }
                    write!(f, "{}={}", value, label)?;
                }
                f.write_str(">")
            }
        }
    }
}

impl FromStr for Descr {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || CompileError::UnsupportedOperand {
            context: "descriptor".to_string(),
            operand: s.to_string(),
        };
        let inner = s
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .ok_or_else(bad)?;
        let (tag, rest) = inner.split_once(':').ok_or_else(bad)?;
        let kind_of = |text: &str| -> CompileResult<Kind> {
            let mut chars = text.chars();
            match (chars.next().and_then(Kind::from_letter), chars.next()) {
                (Some(kind), None) => Ok(kind),
                _ => Err(bad()),
            }
        };
        match tag {
            "jitcode" => Ok(Descr::JitCode(JitCodeId(rest.parse().map_err(|_| bad())?))),
            "call" => {
                let mut parts = rest.rsplitn(3, ':');
                let result = kind_of(parts.next().ok_or_else(bad)?)?;
                let args = parts.next().ok_or_else(bad)?;
                let name = parts.next().ok_or_else(bad)?;
                let arg_kinds = args
                    .chars()
                    .map(|c| Kind::from_letter(c).ok_or_else(bad))
                    .collect::<CompileResult<Vec<_>>>()?;
                Ok(Descr::Call(CallDescr {
                    name: name.to_string(),
                    arg_kinds,
                    result,
                }))
            }
            "field" => {
                let (path, kind) = rest.rsplit_once(':').ok_or_else(bad)?;
                let (owner, name) = path.rsplit_once('.').ok_or_else(bad)?;
                Ok(Descr::Field(FieldDescr {
                    owner: owner.to_string(),
                    name: name.to_string(),
                    kind: kind_of(kind)?,
                }))
            }
            "switch" => {
                let (id, cases) = rest.split_once(':').ok_or_else(bad)?;
                let cases = cases
                    .split(';')
                    .filter(|c| !c.is_empty())
                    .map(|case| {
                        let (value, label) = case.split_once('=').ok_or_else(bad)?;
                        Ok((value.parse().map_err(|_| bad())?, label.to_string()))
                    })
                    .collect::<CompileResult<Vec<_>>>()?;
                Ok(Descr::Switch(SwitchDescr {
                    id: id.parse().map_err(|_| bad())?,
                    cases,
                }))
            }
            _ => Err(bad()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descr_text_form_parses_back() {
        let descrs = [
            Descr::JitCode(JitCodeId(3)),
            Descr::Call(CallDescr {
                name: "ll_append".into(),
                arg_kinds: vec![Kind::Ref, Kind::Int],
                result: Kind::Void,
            }),
            Descr::Call(CallDescr {
                name: "nullary".into(),
                arg_kinds: vec![],
                result: Kind::Int,
            }),
            Descr::Field(FieldDescr {
                owner: "W_IntObject".into(),
                name: "intval".into(),
                kind: Kind::Int,
            }),
            Descr::Switch(SwitchDescr {
                id: 1,
                cases: vec![(-1, "L3".into()), (7, "L4".into())],
            }),
        ];
        for descr in descrs {
            let text = descr.to_string();
            assert_eq!(text.parse::<Descr>().unwrap(), descr, "{}", text);
        }
    }

    #[test]
    fn test_malformed_descr_is_rejected() {
        assert!("<call:f>".parse::<Descr>().is_err());
        assert!("jitcode:1".parse::<Descr>().is_err());
        assert!("<field:x:i>".parse::<Descr>().is_err());
    }
}
