// SPDX-License-Identifier: AGPL-3.0

//! The memory and calldata models.
//!
//! Memory keeps byte cells for concrete offsets (exact byte-level
//! aliasing) and an ordered word-write log. A read at a symbolic offset
//! folds the log into an if-then-else chain keyed on the symbolic
//! offsets, so two offsets the path condition forces equal alias
//! correctly.
//!
//! Calldata is an overlay of laid-out bytes over an uninterpreted base
//! function `f_calldata : BV256 -> BV8`; reads past the logical size
//! yield zero.

use std::collections::BTreeMap;
use std::rc::Rc;
use z3::ast::BV;
use z3::{Context, FuncDecl, Sort};

use symx_constants::MAX_MEMORY_SIZE;
use symx_errors::{SymxError, SymxResult};
use symx_word::{apply_uf, SymByte, Word};

#[derive(Clone, Debug)]
struct WordWrite<'ctx> {
    offset: Word<'ctx>,
    value: Word<'ctx>,
    seq: u64,
}

/// Byte-addressable memory of one execution state.
#[derive(Clone, Debug)]
pub struct Memory<'ctx> {
    cells: Vec<SymByte<'ctx>>,
    cell_seq: Vec<u64>,
    writes: Vec<WordWrite<'ctx>>,
    next_seq: u64,
}

impl<'ctx> Default for Memory<'ctx> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'ctx> Memory<'ctx> {
    pub fn new() -> Self {
        Self {
            cells: Vec::new(),
            cell_seq: Vec::new(),
            writes: Vec::new(),
            next_seq: 1,
        }
    }

    /// Current concrete extent in bytes.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// MSIZE: the extent rounded up to a word boundary.
    pub fn msize(&self) -> usize {
        (self.cells.len() + 31) / 32 * 32
    }

    fn expand(&mut self, end: usize) -> SymxResult<()> {
        if end > MAX_MEMORY_SIZE {
            return Err(SymxError::Internal(format!(
                "memory expansion to {} exceeds the {} byte cap",
                end, MAX_MEMORY_SIZE
            )));
        }
        while self.cells.len() < end {
            self.cells.push(SymByte::Con(0));
            self.cell_seq.push(0);
        }
        Ok(())
    }

    /// MSTORE: a 32-byte write. Symbolic offsets go to the write log.
    pub fn store_word(
        &mut self,
        offset: &Word<'ctx>,
        value: Word<'ctx>,
        ctx: &'ctx Context,
    ) -> SymxResult<()> {
        let seq = self.next_seq;
        self.next_seq += 1;

        if let Some(at) = offset.as_u64() {
            let at = at as usize;
            self.expand(at + 32)?;
            for i in 0..32 {
                self.cells[at + i] = value.byte(i, ctx);
                self.cell_seq[at + i] = seq;
            }
        }
        self.writes.push(WordWrite {
            offset: offset.clone(),
            value,
            seq,
        });
        Ok(())
    }

    /// MSTORE8: requires a concrete offset.
    pub fn store_byte(&mut self, offset: &Word<'ctx>, byte: SymByte<'ctx>) -> SymxResult<()> {
        let at = offset.as_usize("MSTORE8 offset")?;
        self.expand(at + 1)?;
        self.cells[at] = byte;
        self.cell_seq[at] = self.next_seq;
        self.next_seq += 1;
        Ok(())
    }

    /// MLOAD: a 32-byte read reconstructing a word. Concrete reads grow
    /// the extent (MSIZE semantics).
    pub fn load_word(&mut self, offset: &Word<'ctx>, ctx: &'ctx Context) -> SymxResult<Word<'ctx>> {
        Ok(match offset.as_u64() {
            Some(at) => {
                let at = at as usize;
                self.expand(at + 32)?;
                let mut base = self.assemble(at, 32, ctx);
                // a symbolic-offset write newer than every byte read here
                // may alias this location
                let oldest = (at..at + 32)
                    .map(|i| self.cell_seq.get(i).copied().unwrap_or(0))
                    .min()
                    .unwrap_or(0);
                for write in &self.writes {
                    if write.offset.is_con() || write.seq <= oldest {
                        continue;
                    }
                    let hit = write.offset.eq(offset, ctx);
                    base = Word::ite(&hit, &write.value, &base, ctx);
                }
                base
            }
            None => {
                let mut acc = Word::con(0);
                for write in &self.writes {
                    let hit = write.offset.eq(offset, ctx);
                    acc = Word::ite(&hit, &write.value, &acc, ctx);
                }
                acc
            }
        })
    }

    fn assemble(&self, offset: usize, len: usize, ctx: &'ctx Context) -> Word<'ctx> {
        let mut word: Option<Word<'ctx>> = None;
        for i in 0..len {
            let byte = self.cells.get(offset + i).cloned().unwrap_or(SymByte::Con(0));
            let chunk = match byte {
                SymByte::Con(b) => Word::from_bytes(&[b], 8),
                SymByte::Sym(term) => Word::from_bv(term),
            };
            word = Some(match word {
                None => chunk,
                Some(acc) => acc.concat(&chunk, ctx),
            });
        }
        word.unwrap_or_else(|| Word::from_biguint(0u8.into(), 8))
    }

    /// Read a concrete range of bytes (RETURN, REVERT, SHA3, LOG, call
    /// arguments). Bytes beyond the extent are zero.
    pub fn read_bytes(&self, offset: usize, len: usize) -> Vec<SymByte<'ctx>> {
        (offset..offset + len)
            .map(|i| self.cells.get(i).cloned().unwrap_or(SymByte::Con(0)))
            .collect()
    }

    /// Write a concrete range of bytes (copy opcodes).
    pub fn write_bytes(&mut self, offset: usize, bytes: &[SymByte<'ctx>]) -> SymxResult<()> {
        self.expand(offset + bytes.len())?;
        let seq = self.next_seq;
        self.next_seq += 1;
        for (i, byte) in bytes.iter().enumerate() {
            self.cells[offset + i] = byte.clone();
            self.cell_seq[offset + i] = seq;
        }
        Ok(())
    }
}

/// The calldata of one execution state.
#[derive(Clone, Debug)]
pub struct Calldata<'ctx> {
    size: usize,
    overlay: BTreeMap<usize, SymByte<'ctx>>,
    base: Option<Rc<FuncDecl<'ctx>>>,
}

impl<'ctx> Calldata<'ctx> {
    /// Concrete calldata holding just a selector (the setUp frame).
    pub fn concrete(selector: Option<[u8; 4]>) -> Self {
        let mut calldata = Self {
            size: if selector.is_some() { 4 } else { 0 },
            overlay: BTreeMap::new(),
            base: None,
        };
        if let Some(selector) = selector {
            calldata.write_selector(selector);
        }
        calldata
    }

    /// A fixed-size symbolic frame backed by `f_calldata`.
    pub fn symbolic(ctx: &'ctx Context, size: usize) -> Self {
        let bv256 = Sort::bitvector(ctx, 256);
        let bv8 = Sort::bitvector(ctx, 8);
        let base = FuncDecl::new(ctx, "f_calldata", &[&bv256], &bv8);
        Self {
            size,
            overlay: BTreeMap::new(),
            base: Some(Rc::new(base)),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn write_selector(&mut self, selector: [u8; 4]) {
        for (i, byte) in selector.into_iter().enumerate() {
            self.overlay.insert(i, SymByte::Con(byte));
        }
    }

    /// Lay out `len` bytes of a word (of width `8 * len`) at an offset.
    pub fn write_word(&mut self, offset: usize, len: usize, word: &Word<'ctx>, ctx: &'ctx Context) {
        debug_assert_eq!(word.bits() as usize, 8 * len);
        for i in 0..len {
            self.overlay.insert(offset + i, word.byte(i, ctx));
        }
    }

    /// One byte of calldata; zero beyond the logical size.
    pub fn byte_at(&self, index: usize, ctx: &'ctx Context) -> SymByte<'ctx> {
        if index >= self.size {
            return SymByte::Con(0);
        }
        if let Some(byte) = self.overlay.get(&index) {
            return byte.clone();
        }
        match &self.base {
            Some(base) => {
                let idx = BV::from_u64(ctx, index as u64, 256);
                SymByte::Sym(apply_uf(base, &[idx]))
            }
            None => SymByte::Con(0),
        }
    }

    /// CALLDATALOAD: a 32-byte read at a possibly symbolic offset.
    pub fn load_word(&self, offset: &Word<'ctx>, ctx: &'ctx Context) -> Word<'ctx> {
        match offset.as_u64() {
            Some(at) => {
                let mut word: Option<Word<'ctx>> = None;
                for i in 0..32 {
                    let chunk = match self.byte_at(at as usize + i, ctx) {
                        SymByte::Con(b) => Word::from_bytes(&[b], 8),
                        SymByte::Sym(term) => Word::from_bv(term),
                    };
                    word = Some(match word {
                        None => chunk,
                        Some(acc) => acc.concat(&chunk, ctx),
                    });
                }
                word.expect("32 bytes")
            }
            None => match &self.base {
                Some(base) => {
                    // bytes at offset + i through the base function; the
                    // overlay is over-approximated away for symbolic
                    // offsets
                    let mut word: Option<Word<'ctx>> = None;
                    for i in 0..32 {
                        let idx = offset.add_with(&Word::con(i as u64), ctx, None);
                        let in_range = idx.ult(&Word::con(self.size as u64), ctx);
                        let raw = Word::from_bv(apply_uf(base, &[idx.to_bv(ctx)]));
                        let byte = Word::ite(&in_range, &raw, &Word::from_biguint(0u8.into(), 8), ctx);
                        word = Some(match word {
                            None => byte,
                            Some(acc) => acc.concat(&byte, ctx),
                        });
                    }
                    word.expect("32 bytes")
                }
                None => Word::con(0),
            },
        }
    }
}
