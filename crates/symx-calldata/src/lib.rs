// SPDX-License-Identifier: AGPL-3.0

//! ABI-driven symbolic calldata layout.
//!
//! The selector occupies bytes 0..4. A 32-byte head slot per parameter
//! follows in declaration order: primitives and fixed-size arrays get a
//! fresh symbolic word per slot, while `bytes`/`string` parameters get a
//! concrete tail pointer, a concrete length slot equal to the configured
//! array length, and a single fresh symbolic byte string for the data.
//! Struct (`tuple`) parameters and dynamic arrays are not supported.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use z3::Context;

use symx_errors::{SymxError, SymxResult};
use symx_word::Word;

/// One parameter of an ABI function entry.
#[derive(Debug, Clone, Deserialize)]
pub struct AbiParam {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

/// One entry of a contract ABI.
#[derive(Debug, Clone, Deserialize)]
pub struct AbiEntry {
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<AbiParam>,
}

/// A pending write into the calldata buffer.
#[derive(Debug, Clone)]
pub struct LayoutWrite<'ctx> {
    /// Byte offset into calldata.
    pub offset: usize,
    /// Width in bytes; the word is `8 * len` bits wide.
    pub len: usize,
    pub word: Word<'ctx>,
}

/// The symbolic layout for one test function's inputs.
#[derive(Debug, Default)]
pub struct CalldataLayout<'ctx> {
    pub writes: Vec<LayoutWrite<'ctx>>,
    /// Fresh input variables, in declaration order, for model reporting.
    pub inputs: Vec<(String, Word<'ctx>)>,
    /// Human-readable bound sizes, e.g. `|data|=64`.
    pub dyn_bounds: Vec<String>,
}

static PRIMITIVE_TYPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(u?int[0-9]*|address|bool|bytes[0-9]+)(\[([0-9]+)\])?$").expect("type regex")
});

/// Build the calldata layout for `funname` from the ABI. Layout starts
/// at byte 4, right after the selector.
pub fn layout_calldata<'ctx>(
    ctx: &'ctx Context,
    abi: &[AbiEntry],
    funname: &str,
    arrlen: &HashMap<String, usize>,
    default_len: usize,
) -> SymxResult<CalldataLayout<'ctx>> {
    let entry = abi
        .iter()
        .find(|item| item.ty == "function" && item.name == funname)
        .ok_or_else(|| SymxError::Artifact(format!("function not in abi: {}", funname)))?;

    let mut layout = CalldataLayout::default();
    let mut offset = 0usize;
    // (head slot offset, param) pairs for bytes/string tails
    let mut deferred: Vec<(usize, &AbiParam)> = Vec::new();

    for param in &entry.inputs {
        match param.ty.as_str() {
            "tuple" => {
                return Err(SymxError::NotSupported(format!(
                    "{} (struct parameter {})",
                    param.ty, param.name
                )));
            }
            "bytes" | "string" => {
                deferred.push((4 + offset, param));
                offset += 32;
            }
            ty if ty.ends_with("[]") => {
                return Err(SymxError::NotSupported(format!(
                    "{} (dynamic array parameter {})",
                    ty, param.name
                )));
            }
            ty => {
                let caps = PRIMITIVE_TYPE
                    .captures(ty)
                    .ok_or_else(|| SymxError::NotSupported(format!("unknown type {}", ty)))?;
                let base = caps.get(1).expect("base type").as_str();

                if let Some(dim) = caps.get(3) {
                    let dim: usize = dim
                        .as_str()
                        .parse()
                        .map_err(|_| SymxError::Artifact(format!("bad array size in {}", ty)))?;
                    for idx in 0..dim {
                        let name = format!("p_{}[{}]_{}", param.name, idx, base);
                        let word = Word::fresh(ctx, &name, 256);
                        layout.inputs.push((name, word.clone()));
                        layout.writes.push(LayoutWrite {
                            offset: 4 + offset,
                            len: 32,
                            word,
                        });
                        offset += 32;
                    }
                } else {
                    let name = format!("p_{}_{}", param.name, base);
                    let word = Word::fresh(ctx, &name, 256);
                    layout.inputs.push((name, word.clone()));
                    layout.writes.push(LayoutWrite {
                        offset: 4 + offset,
                        len: 32,
                        word,
                    });
                    offset += 32;
                }
            }
        }
    }

    for (head, param) in deferred {
        let size = match arrlen.get(&param.name) {
            Some(&size) => size,
            None => {
                symx_logs::warn_unique(&format!(
                    "size of {} not given, using default value {}",
                    param.name, default_len
                ));
                default_len
            }
        };
        layout.dyn_bounds.push(format!("|{}|={}", param.name, size));

        // head slot holds the tail offset, relative to the end of the selector
        layout.writes.push(LayoutWrite {
            offset: head,
            len: 32,
            word: Word::con(offset as u64),
        });

        // tail: 32-byte length, then data padded up to 32
        layout.writes.push(LayoutWrite {
            offset: 4 + offset,
            len: 32,
            word: Word::con(size as u64),
        });
        offset += 32;

        let size_pad_right = (size + 31) / 32 * 32;
        if size_pad_right > 0 {
            let name = format!("p_{}_{}", param.name, param.ty);
            let word = Word::fresh(ctx, &name, (8 * size_pad_right) as u32);
            layout.inputs.push((name, word.clone()));
            layout.writes.push(LayoutWrite {
                offset: 4 + offset,
                len: size_pad_right,
                word,
            });
            offset += size_pad_right;
        }
    }

    Ok(layout)
}

/// Decode a 4-byte selector from its hex form in `methodIdentifiers`.
pub fn parse_selector(hex_selector: &str) -> SymxResult<[u8; 4]> {
    let bytes = hex::decode(hex_selector.trim().trim_start_matches("0x"))
        .map_err(|e| SymxError::Artifact(format!("invalid selector: {}", e)))?;
    if bytes.len() != 4 {
        return Err(SymxError::Artifact(format!(
            "selector must be 4 bytes, got {}",
            bytes.len()
        )));
    }
    Ok([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use z3::Config;

    fn abi_from_json(json: &str) -> Vec<AbiEntry> {
        serde_json::from_str(json).unwrap()
    }

    fn fun(inputs: &str) -> Vec<AbiEntry> {
        abi_from_json(&format!(
            r#"[{{"type": "function", "name": "test_f", "inputs": {}}}]"#,
            inputs
        ))
    }

    #[test]
    fn test_primitive_layout() {
        let ctx = Context::new(&Config::new());
        let abi = fun(r#"[{"name": "x", "type": "uint256"}, {"name": "y", "type": "address"}]"#);
        let layout = layout_calldata(&ctx, &abi, "test_f", &HashMap::new(), 2).unwrap();

        assert_eq!(layout.writes.len(), 2);
        assert_eq!(layout.writes[0].offset, 4);
        assert_eq!(layout.writes[1].offset, 36);
        assert_eq!(layout.inputs[0].0, "p_x_uint256");
        assert_eq!(layout.inputs[1].0, "p_y_address");
        assert!(layout.dyn_bounds.is_empty());
    }

    #[test]
    fn test_fixed_array_layout() {
        let ctx = Context::new(&Config::new());
        let abi = fun(r#"[{"name": "a", "type": "uint256[3]"}]"#);
        let layout = layout_calldata(&ctx, &abi, "test_f", &HashMap::new(), 2).unwrap();

        assert_eq!(layout.writes.len(), 3);
        assert_eq!(layout.inputs[0].0, "p_a[0]_uint256");
        assert_eq!(layout.inputs[2].0, "p_a[2]_uint256");
        assert_eq!(layout.writes[2].offset, 4 + 64);
    }

    #[test]
    fn test_bytes_layout() {
        let ctx = Context::new(&Config::new());
        let abi = fun(r#"[{"name": "b", "type": "bytes"}]"#);
        let mut arrlen = HashMap::new();
        arrlen.insert("b".to_string(), 64usize);
        let layout = layout_calldata(&ctx, &abi, "test_f", &arrlen, 2).unwrap();

        assert_eq!(layout.dyn_bounds, vec!["|b|=64"]);
        // head pointer at byte 4 points to the tail (offset 32)
        assert_eq!(layout.writes[0].offset, 4);
        assert_eq!(layout.writes[0].word.as_u64(), Some(32));
        // length slot
        assert_eq!(layout.writes[1].offset, 36);
        assert_eq!(layout.writes[1].word.as_u64(), Some(64));
        // data: one symbolic string of 64 bytes
        assert_eq!(layout.writes[2].offset, 68);
        assert_eq!(layout.writes[2].len, 64);
        assert_eq!(layout.writes[2].word.bits(), 512);
        assert_eq!(layout.inputs[0].0, "p_b_bytes");
    }

    #[test]
    fn test_bytes_defaults_to_loop_bound() {
        let ctx = Context::new(&Config::new());
        let abi = fun(r#"[{"name": "s", "type": "string"}]"#);
        let layout = layout_calldata(&ctx, &abi, "test_f", &HashMap::new(), 2).unwrap();
        assert_eq!(layout.dyn_bounds, vec!["|s|=2"]);
        // 2 bytes pad up to one 32-byte slot
        assert_eq!(layout.writes[2].len, 32);
    }

    #[test]
    fn test_mixed_heads_then_tails() {
        let ctx = Context::new(&Config::new());
        let abi = fun(
            r#"[{"name": "x", "type": "uint256"}, {"name": "b", "type": "bytes"}, {"name": "y", "type": "bool"}]"#,
        );
        let mut arrlen = HashMap::new();
        arrlen.insert("b".to_string(), 32usize);
        let layout = layout_calldata(&ctx, &abi, "test_f", &arrlen, 2).unwrap();

        // heads: x at 4, pointer at 36, y at 68; tail after 96 head bytes
        let pointer = layout
            .writes
            .iter()
            .find(|w| w.offset == 36)
            .expect("pointer slot");
        assert_eq!(pointer.word.as_u64(), Some(96));
        let length = layout
            .writes
            .iter()
            .find(|w| w.offset == 4 + 96)
            .expect("length slot");
        assert_eq!(length.word.as_u64(), Some(32));
    }

    #[test]
    fn test_unsupported_types() {
        let ctx = Context::new(&Config::new());

        let abi = fun(r#"[{"name": "t", "type": "tuple"}]"#);
        let err = layout_calldata(&ctx, &abi, "test_f", &HashMap::new(), 2).unwrap_err();
        assert!(matches!(err, SymxError::NotSupported(_)));

        let abi = fun(r#"[{"name": "a", "type": "uint256[]"}]"#);
        let err = layout_calldata(&ctx, &abi, "test_f", &HashMap::new(), 2).unwrap_err();
        assert!(matches!(err, SymxError::NotSupported(_)));
    }

    #[test]
    fn test_parse_selector() {
        assert_eq!(parse_selector("0a9254e4").unwrap(), [0x0a, 0x92, 0x54, 0xe4]);
        assert_eq!(parse_selector("0x0a9254e4").unwrap(), [0x0a, 0x92, 0x54, 0xe4]);
        assert!(parse_selector("0a92").is_err());
    }
}
