// SPDX-License-Identifier: AGPL-3.0

//! Symbolic 256-bit values.
//!
//! Every EVM word operation goes through a smart constructor here: when
//! all operands are concrete the result is folded with EVM semantics
//! (wrapping at the word width, division and modulo by zero yielding
//! zero, two's-complement signed variants); otherwise a Z3 term is built,
//! either with the native bitvector operator or with an uninterpreted
//! function supplied by the caller.

use num_bigint::{BigInt, BigUint, Sign};
use num_traits::{One, ToPrimitive, Zero};
use std::fmt;
use xxhash_rust::xxh3::xxh3_64;
use z3::ast::{Ast, Bool as Z3Bool, BV};
use z3::{Context, FuncDecl};

use symx_errors::{SymxError, SymxResult};

fn mask(bits: u32) -> BigUint {
    (BigUint::one() << bits as usize) - BigUint::one()
}

fn wrap(value: BigUint, bits: u32) -> BigUint {
    value & mask(bits)
}

fn is_pow2(value: &BigUint) -> bool {
    if value.is_zero() {
        return false;
    }
    let minus_one = value - BigUint::one();
    (value & &minus_one).is_zero()
}

/// Interpret an unsigned value of the given width as two's complement.
fn as_signed(value: &BigUint, bits: u32) -> BigInt {
    let sign_bit = BigUint::one() << (bits as usize - 1);
    if value < &sign_bit {
        BigInt::from(value.clone())
    } else {
        let modulus = BigUint::one() << bits as usize;
        BigInt::from_biguint(Sign::Minus, modulus - value)
    }
}

/// Re-encode a signed value as an unsigned word of the given width.
fn from_signed(value: &BigInt, bits: u32) -> BigUint {
    let modulus = BigUint::one() << bits as usize;
    match value.sign() {
        Sign::NoSign => BigUint::zero(),
        Sign::Plus => wrap(value.to_biguint().expect("positive"), bits),
        Sign::Minus => {
            let magnitude = (-value).to_biguint().expect("negative magnitude");
            wrap(modulus - magnitude, bits)
        }
    }
}

/// Build a Z3 bitvector constant of arbitrary width from a BigUint.
fn biguint_to_bv<'ctx>(ctx: &'ctx Context, value: &BigUint, bits: u32) -> BV<'ctx> {
    if let Some(small) = value.to_u64() {
        if bits <= 64 {
            return BV::from_u64(ctx, small, bits);
        }
        return BV::from_u64(ctx, small, 64).zero_ext(bits - 64);
    }

    // Wide constant: assemble byte by byte.
    let num_bytes = ((bits as usize) + 7) / 8;
    let raw = value.to_bytes_be();
    let mut bytes = vec![0u8; num_bytes.saturating_sub(raw.len())];
    bytes.extend_from_slice(&raw[raw.len().saturating_sub(num_bytes)..]);

    let mut acc = BV::from_u64(ctx, bytes[0] as u64, 8);
    for &byte in &bytes[1..] {
        acc = acc.concat(&BV::from_u64(ctx, byte as u64, 8));
    }
    if bits % 8 == 0 {
        acc
    } else {
        acc.extract(bits - 1, 0)
    }
}

/// Apply a bitvector-valued uninterpreted function.
pub fn apply_uf<'ctx>(decl: &FuncDecl<'ctx>, args: &[BV<'ctx>]) -> BV<'ctx> {
    let ast_args: Vec<&dyn Ast<'ctx>> = args.iter().map(|arg| arg as &dyn Ast<'ctx>).collect();
    decl.apply(&ast_args)
        .as_bv()
        .expect("uninterpreted EVM function must return a bitvector")
}

/// Structural fingerprint of a term, used for storage-read naming, the
/// SHA3 table, and the step-log stack hashes.
pub fn fingerprint(text: &str) -> u64 {
    xxh3_64(text.as_bytes())
}

/// A symbolic or concrete boolean.
#[derive(Clone)]
pub enum SymBool<'ctx> {
    Con(bool),
    Sym(Z3Bool<'ctx>),
}

impl<'ctx> SymBool<'ctx> {
    /// Wrap a Z3 boolean, folding to a literal when simplification allows.
    pub fn from_z3(term: Z3Bool<'ctx>) -> Self {
        match term.simplify().as_bool() {
            Some(b) => SymBool::Con(b),
            None => SymBool::Sym(term),
        }
    }

    pub fn is_con(&self) -> bool {
        matches!(self, SymBool::Con(_))
    }

    pub fn is_true(&self) -> bool {
        matches!(self, SymBool::Con(true))
    }

    pub fn is_false(&self) -> bool {
        matches!(self, SymBool::Con(false))
    }

    pub fn to_z3(&self, ctx: &'ctx Context) -> Z3Bool<'ctx> {
        match self {
            SymBool::Con(b) => Z3Bool::from_bool(ctx, *b),
            SymBool::Sym(term) => term.clone(),
        }
    }

    pub fn not(&self) -> Self {
        match self {
            SymBool::Con(b) => SymBool::Con(!b),
            SymBool::Sym(term) => SymBool::Sym(term.not()),
        }
    }

    pub fn or(&self, other: &Self, ctx: &'ctx Context) -> Self {
        match (self, other) {
            (SymBool::Con(true), _) | (_, SymBool::Con(true)) => SymBool::Con(true),
            (SymBool::Con(false), rhs) => rhs.clone(),
            (lhs, SymBool::Con(false)) => lhs.clone(),
            (SymBool::Sym(a), SymBool::Sym(b)) => SymBool::from_z3(Z3Bool::or(ctx, &[a, b])),
        }
    }

    pub fn and(&self, other: &Self, ctx: &'ctx Context) -> Self {
        match (self, other) {
            (SymBool::Con(false), _) | (_, SymBool::Con(false)) => SymBool::Con(false),
            (SymBool::Con(true), rhs) => rhs.clone(),
            (lhs, SymBool::Con(true)) => lhs.clone(),
            (SymBool::Sym(a), SymBool::Sym(b)) => SymBool::from_z3(Z3Bool::and(ctx, &[a, b])),
        }
    }

    /// Encode as a word: 1 when true, 0 when false.
    pub fn to_word(&self, ctx: &'ctx Context) -> Word<'ctx> {
        match self {
            SymBool::Con(b) => Word::con(*b as u64),
            SymBool::Sym(term) => {
                let one = BV::from_u64(ctx, 1, 256);
                let zero = BV::from_u64(ctx, 0, 256);
                Word::from_bv(term.ite(&one, &zero))
            }
        }
    }
}

impl<'ctx> fmt::Debug for SymBool<'ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymBool::Con(b) => write!(f, "Bool({})", b),
            SymBool::Sym(term) => write!(f, "Bool({})", term),
        }
    }
}

/// A single byte, concrete or symbolic.
#[derive(Clone)]
pub enum SymByte<'ctx> {
    Con(u8),
    Sym(BV<'ctx>),
}

impl<'ctx> SymByte<'ctx> {
    pub fn to_bv(&self, ctx: &'ctx Context) -> BV<'ctx> {
        match self {
            SymByte::Con(b) => BV::from_u64(ctx, *b as u64, 8),
            SymByte::Sym(term) => term.clone(),
        }
    }

    pub fn as_con(&self) -> Option<u8> {
        match self {
            SymByte::Con(b) => Some(*b),
            SymByte::Sym(_) => None,
        }
    }
}

impl<'ctx> fmt::Debug for SymByte<'ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymByte::Con(b) => write!(f, "{:#04x}", b),
            SymByte::Sym(term) => write!(f, "{}", term),
        }
    }
}

/// A fixed-width bitvector value, concrete or symbolic.
///
/// EVM words are 256 bits; other widths appear for calldata tails,
/// SHA3 inputs, and the widened ADDMOD/MULMOD intermediates.
#[derive(Clone)]
pub enum Word<'ctx> {
    Con { value: BigUint, bits: u32 },
    Sym { term: BV<'ctx>, bits: u32 },
}

impl<'ctx> Word<'ctx> {
    /// A concrete 256-bit word.
    pub fn con(value: u64) -> Self {
        Word::from_biguint(BigUint::from(value), 256)
    }

    pub fn from_biguint(value: BigUint, bits: u32) -> Self {
        Word::Con {
            value: wrap(value, bits),
            bits,
        }
    }

    /// Big-endian bytes, interpreted at the given width.
    pub fn from_bytes(bytes: &[u8], bits: u32) -> Self {
        Word::from_biguint(BigUint::from_bytes_be(bytes), bits)
    }

    pub fn from_bv(term: BV<'ctx>) -> Self {
        let bits = term.get_size();
        Word::Sym { term, bits }
    }

    /// A fresh symbolic constant.
    pub fn fresh(ctx: &'ctx Context, name: &str, bits: u32) -> Self {
        Word::Sym {
            term: BV::new_const(ctx, name, bits),
            bits,
        }
    }

    pub fn bits(&self) -> u32 {
        match self {
            Word::Con { bits, .. } => *bits,
            Word::Sym { bits, .. } => *bits,
        }
    }

    pub fn is_con(&self) -> bool {
        matches!(self, Word::Con { .. })
    }

    pub fn as_biguint(&self) -> Option<&BigUint> {
        match self {
            Word::Con { value, .. } => Some(value),
            Word::Sym { .. } => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_biguint().and_then(|v| v.to_u64())
    }

    /// Concrete value as usize, or a NotConcrete error naming the use.
    pub fn as_usize(&self, what: &str) -> SymxResult<usize> {
        self.as_biguint()
            .and_then(|v| v.to_usize())
            .ok_or_else(|| SymxError::NotConcrete(what.to_string()))
    }

    pub fn to_bv(&self, ctx: &'ctx Context) -> BV<'ctx> {
        match self {
            Word::Con { value, bits } => biguint_to_bv(ctx, value, *bits),
            Word::Sym { term, .. } => term.clone(),
        }
    }

    /// Big-endian bytes of a concrete value, sized to the width.
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        let value = self.as_biguint()?;
        let len = (self.bits() as usize + 7) / 8;
        let raw = value.to_bytes_be();
        let mut out = vec![0u8; len.saturating_sub(raw.len())];
        out.extend_from_slice(&raw);
        Some(out)
    }

    /// Big-endian byte at index `i` (0 is most significant).
    pub fn byte(&self, i: usize, ctx: &'ctx Context) -> SymByte<'ctx> {
        let len = (self.bits() as usize + 7) / 8;
        if i >= len {
            return SymByte::Con(0);
        }
        match self {
            Word::Con { .. } => {
                let bytes = self.to_bytes().expect("concrete word has bytes");
                SymByte::Con(bytes[i])
            }
            Word::Sym { term, .. } => {
                let lo = ((len - 1 - i) * 8) as u32;
                SymByte::Sym(term.extract(lo + 7, lo))
            }
        }
    }

    /// Structural fingerprint, stable across structurally equal terms.
    pub fn fingerprint(&self, ctx: &'ctx Context) -> u64 {
        match self {
            Word::Con { value, bits } => fingerprint(&format!("#{}:{}", bits, value)),
            Word::Sym { .. } => fingerprint(&self.to_bv(ctx).to_string()),
        }
    }

    //
    // arithmetic
    //

    /// Addition; `uf` selects the uninterpreted encoding when given.
    pub fn add_with(&self, other: &Self, ctx: &'ctx Context, uf: Option<&FuncDecl<'ctx>>) -> Self {
        debug_assert_eq!(self.bits(), other.bits());
        match (self, other) {
            (Word::Con { value: a, bits }, Word::Con { value: b, .. }) => {
                Word::from_biguint(a + b, *bits)
            }
            _ => match uf {
                Some(f) => Word::from_bv(apply_uf(f, &[self.to_bv(ctx), other.to_bv(ctx)])),
                None => Word::from_bv(self.to_bv(ctx).bvadd(&other.to_bv(ctx))),
            },
        }
    }

    pub fn sub_with(&self, other: &Self, ctx: &'ctx Context, uf: Option<&FuncDecl<'ctx>>) -> Self {
        debug_assert_eq!(self.bits(), other.bits());
        match (self, other) {
            (Word::Con { value: a, bits }, Word::Con { value: b, .. }) => {
                let modulus = BigUint::one() << *bits as usize;
                if a >= b {
                    Word::from_biguint(a - b, *bits)
                } else {
                    Word::from_biguint(modulus - (b - a), *bits)
                }
            }
            _ => match uf {
                Some(f) => Word::from_bv(apply_uf(f, &[self.to_bv(ctx), other.to_bv(ctx)])),
                None => Word::from_bv(self.to_bv(ctx).bvsub(&other.to_bv(ctx))),
            },
        }
    }

    pub fn mul_with(&self, other: &Self, ctx: &'ctx Context, uf: Option<&FuncDecl<'ctx>>) -> Self {
        debug_assert_eq!(self.bits(), other.bits());
        match (self, other) {
            (Word::Con { value: a, bits }, Word::Con { value: b, .. }) => {
                Word::from_biguint(a * b, *bits)
            }
            (Word::Con { value: c, bits }, sym) | (sym, Word::Con { value: c, bits }) => {
                if c.is_zero() {
                    return Word::from_biguint(BigUint::zero(), *bits);
                }
                if c.is_one() {
                    return sym.clone();
                }
                if is_pow2(c) {
                    let shift = c.bits() - 1;
                    return sym.shl(&Word::from_biguint(BigUint::from(shift), *bits), ctx);
                }
                match uf {
                    Some(f) => Word::from_bv(apply_uf(f, &[self.to_bv(ctx), other.to_bv(ctx)])),
                    None => Word::from_bv(self.to_bv(ctx).bvmul(&other.to_bv(ctx))),
                }
            }
            _ => match uf {
                Some(f) => Word::from_bv(apply_uf(f, &[self.to_bv(ctx), other.to_bv(ctx)])),
                None => Word::from_bv(self.to_bv(ctx).bvmul(&other.to_bv(ctx))),
            },
        }
    }

    /// Unsigned division with the EVM divide-by-zero rule. The native
    /// symbolic encoding guards the divisor: `ite(y = 0, 0, x /u y)`.
    pub fn udiv_with(&self, other: &Self, ctx: &'ctx Context, uf: Option<&FuncDecl<'ctx>>) -> Self {
        debug_assert_eq!(self.bits(), other.bits());
        let bits = self.bits();
        match (self, other) {
            (_, Word::Con { value, .. }) if value.is_zero() => {
                Word::from_biguint(BigUint::zero(), bits)
            }
            (_, Word::Con { value, .. }) if value.is_one() => self.clone(),
            (Word::Con { value: a, .. }, Word::Con { value: b, .. }) => {
                Word::from_biguint(a / b, bits)
            }
            (Word::Sym { .. }, Word::Con { value, .. }) if is_pow2(value) => {
                let shift = value.bits() - 1;
                self.lshr(&Word::from_biguint(BigUint::from(shift), bits), ctx)
            }
            _ => match uf {
                Some(f) => Word::from_bv(apply_uf(f, &[self.to_bv(ctx), other.to_bv(ctx)])),
                None => {
                    let x = self.to_bv(ctx);
                    let y = other.to_bv(ctx);
                    let zero = BV::from_u64(ctx, 0, bits);
                    Word::from_bv(y._eq(&zero).ite(&zero, &x.bvudiv(&y)))
                }
            },
        }
    }

    pub fn urem_with(&self, other: &Self, ctx: &'ctx Context, uf: Option<&FuncDecl<'ctx>>) -> Self {
        debug_assert_eq!(self.bits(), other.bits());
        let bits = self.bits();
        match (self, other) {
            (_, Word::Con { value, .. }) if value.is_zero() => {
                Word::from_biguint(BigUint::zero(), bits)
            }
            (Word::Con { value: a, .. }, Word::Con { value: b, .. }) => {
                Word::from_biguint(a % b, bits)
            }
            (Word::Sym { .. }, Word::Con { value, .. }) if is_pow2(value) => {
                let low = value.bits() as u32 - 1;
                if low == 0 {
                    return Word::from_biguint(BigUint::zero(), bits);
                }
                self.extract_low(low, ctx).zero_ext(bits, ctx)
            }
            _ => match uf {
                Some(f) => Word::from_bv(apply_uf(f, &[self.to_bv(ctx), other.to_bv(ctx)])),
                None => {
                    let x = self.to_bv(ctx);
                    let y = other.to_bv(ctx);
                    let zero = BV::from_u64(ctx, 0, bits);
                    Word::from_bv(y._eq(&zero).ite(&zero, &x.bvurem(&y)))
                }
            },
        }
    }

    pub fn sdiv_with(&self, other: &Self, ctx: &'ctx Context, uf: Option<&FuncDecl<'ctx>>) -> Self {
        debug_assert_eq!(self.bits(), other.bits());
        let bits = self.bits();
        match (self, other) {
            (_, Word::Con { value, .. }) if value.is_zero() => {
                Word::from_biguint(BigUint::zero(), bits)
            }
            (Word::Con { value: a, .. }, Word::Con { value: b, .. }) => {
                let q = as_signed(a, bits) / as_signed(b, bits);
                Word::from_biguint(from_signed(&q, bits), bits)
            }
            _ => match uf {
                Some(f) => Word::from_bv(apply_uf(f, &[self.to_bv(ctx), other.to_bv(ctx)])),
                None => {
                    let x = self.to_bv(ctx);
                    let y = other.to_bv(ctx);
                    let zero = BV::from_u64(ctx, 0, bits);
                    Word::from_bv(y._eq(&zero).ite(&zero, &x.bvsdiv(&y)))
                }
            },
        }
    }

    pub fn srem_with(&self, other: &Self, ctx: &'ctx Context, uf: Option<&FuncDecl<'ctx>>) -> Self {
        debug_assert_eq!(self.bits(), other.bits());
        let bits = self.bits();
        match (self, other) {
            (_, Word::Con { value, .. }) if value.is_zero() => {
                Word::from_biguint(BigUint::zero(), bits)
            }
            (Word::Con { value: a, .. }, Word::Con { value: b, .. }) => {
                let r = as_signed(a, bits) % as_signed(b, bits);
                Word::from_biguint(from_signed(&r, bits), bits)
            }
            _ => match uf {
                Some(f) => Word::from_bv(apply_uf(f, &[self.to_bv(ctx), other.to_bv(ctx)])),
                None => {
                    let x = self.to_bv(ctx);
                    let y = other.to_bv(ctx);
                    let zero = BV::from_u64(ctx, 0, bits);
                    Word::from_bv(y._eq(&zero).ite(&zero, &x.bvsrem(&y)))
                }
            },
        }
    }

    /// Exponentiation: concrete folds with modpow, a concrete exponent up
    /// to `exp_by_const` unrolls into repeated multiplication (through the
    /// `mul` dispatch), anything else applies `exp_uf`.
    pub fn exp_with(
        &self,
        other: &Self,
        ctx: &'ctx Context,
        exp_uf: &FuncDecl<'ctx>,
        mul_uf: Option<&FuncDecl<'ctx>>,
        exp_by_const: u32,
    ) -> Self {
        debug_assert_eq!(self.bits(), other.bits());
        let bits = self.bits();

        if let Word::Con { value: e, .. } = other {
            if e.is_zero() {
                // EXP(0, 0) = 1
                return Word::from_biguint(BigUint::one(), bits);
            }
            if e.is_one() {
                return self.clone();
            }
            if let Word::Con { value: b, .. } = self {
                let modulus = BigUint::one() << bits as usize;
                return Word::from_biguint(b.modpow(e, &modulus), bits);
            }
            if let Some(e_small) = e.to_u32() {
                if e_small <= exp_by_const {
                    let mut acc = self.clone();
                    for _ in 1..e_small {
                        acc = acc.mul_with(self, ctx, mul_uf);
                    }
                    return acc;
                }
            }
        }

        Word::from_bv(apply_uf(exp_uf, &[self.to_bv(ctx), other.to_bv(ctx)]))
    }

    /// (a + b) mod n, exact via an 8-bit-widened intermediate.
    pub fn addmod(&self, other: &Self, modulus: &Self, ctx: &'ctx Context) -> Self {
        debug_assert_eq!(self.bits(), other.bits());
        debug_assert_eq!(self.bits(), modulus.bits());
        let bits = self.bits();

        if let (Word::Con { value: a, .. }, Word::Con { value: b, .. }, Word::Con { value: n, .. }) =
            (self, other, modulus)
        {
            if n.is_zero() {
                return Word::from_biguint(BigUint::zero(), bits);
            }
            return Word::from_biguint((a + b) % n, bits);
        }

        let wide = bits + 8;
        let sum = self
            .zero_ext(wide, ctx)
            .add_with(&other.zero_ext(wide, ctx), ctx, None);
        sum.urem_with(&modulus.zero_ext(wide, ctx), ctx, None)
            .extract_low(bits, ctx)
    }

    /// (a * b) mod n, exact via a doubled-width intermediate.
    pub fn mulmod(&self, other: &Self, modulus: &Self, ctx: &'ctx Context) -> Self {
        debug_assert_eq!(self.bits(), other.bits());
        debug_assert_eq!(self.bits(), modulus.bits());
        let bits = self.bits();

        if let (Word::Con { value: a, .. }, Word::Con { value: b, .. }, Word::Con { value: n, .. }) =
            (self, other, modulus)
        {
            if n.is_zero() {
                return Word::from_biguint(BigUint::zero(), bits);
            }
            return Word::from_biguint((a * b) % n, bits);
        }

        let wide = bits * 2;
        let product = self
            .zero_ext(wide, ctx)
            .mul_with(&other.zero_ext(wide, ctx), ctx, None);
        product
            .urem_with(&modulus.zero_ext(wide, ctx), ctx, None)
            .extract_low(bits, ctx)
    }

    /// SIGNEXTEND with a concrete byte index.
    pub fn signextend(&self, byte_index: u32, ctx: &'ctx Context) -> Self {
        debug_assert_eq!(self.bits(), 256);
        if byte_index >= 31 {
            return self.clone();
        }
        let low = (byte_index + 1) * 8;

        match self {
            Word::Con { value, .. } => {
                let truncated = wrap(value.clone(), low);
                let sign_bit = BigUint::one() << (low as usize - 1);
                if truncated >= sign_bit {
                    Word::from_biguint(&truncated | (mask(256) ^ mask(low)), 256)
                } else {
                    Word::from_biguint(truncated, 256)
                }
            }
            Word::Sym { .. } => {
                let term = self.to_bv(ctx).extract(low - 1, 0).sign_ext(256 - low);
                Word::from_bv(term)
            }
        }
    }

    //
    // bitwise and shifts
    //

    pub fn and(&self, other: &Self, ctx: &'ctx Context) -> Self {
        match (self, other) {
            (Word::Con { value: a, bits }, Word::Con { value: b, .. }) => {
                Word::from_biguint(a & b, *bits)
            }
            _ => Word::from_bv(self.to_bv(ctx).bvand(&other.to_bv(ctx))),
        }
    }

    pub fn or(&self, other: &Self, ctx: &'ctx Context) -> Self {
        match (self, other) {
            (Word::Con { value: a, bits }, Word::Con { value: b, .. }) => {
                Word::from_biguint(a | b, *bits)
            }
            _ => Word::from_bv(self.to_bv(ctx).bvor(&other.to_bv(ctx))),
        }
    }

    pub fn xor(&self, other: &Self, ctx: &'ctx Context) -> Self {
        match (self, other) {
            (Word::Con { value: a, bits }, Word::Con { value: b, .. }) => {
                Word::from_biguint(a ^ b, *bits)
            }
            _ => Word::from_bv(self.to_bv(ctx).bvxor(&other.to_bv(ctx))),
        }
    }

    pub fn not(&self, ctx: &'ctx Context) -> Self {
        match self {
            Word::Con { value, bits } => Word::from_biguint(&mask(*bits) ^ value, *bits),
            Word::Sym { .. } => Word::from_bv(self.to_bv(ctx).bvnot()),
        }
    }

    pub fn shl(&self, shift: &Self, ctx: &'ctx Context) -> Self {
        match (self, shift) {
            (Word::Con { value, bits }, Word::Con { value: amount, .. }) => {
                match amount.to_u32() {
                    Some(n) if n < *bits => Word::from_biguint(value << n as usize, *bits),
                    _ => Word::from_biguint(BigUint::zero(), *bits),
                }
            }
            _ => Word::from_bv(self.to_bv(ctx).bvshl(&shift.to_bv(ctx))),
        }
    }

    pub fn lshr(&self, shift: &Self, ctx: &'ctx Context) -> Self {
        match (self, shift) {
            (Word::Con { value, bits }, Word::Con { value: amount, .. }) => {
                match amount.to_u32() {
                    Some(n) if n < *bits => Word::from_biguint(value >> n as usize, *bits),
                    _ => Word::from_biguint(BigUint::zero(), *bits),
                }
            }
            _ => Word::from_bv(self.to_bv(ctx).bvlshr(&shift.to_bv(ctx))),
        }
    }

    pub fn ashr(&self, shift: &Self, ctx: &'ctx Context) -> Self {
        match (self, shift) {
            (Word::Con { value, bits }, Word::Con { value: amount, .. }) => {
                let signed = as_signed(value, *bits);
                let shifted = match amount.to_u32() {
                    Some(n) if n < *bits => signed >> n as usize,
                    // shifting out everything leaves the sign
                    _ => signed >> (*bits as usize - 1),
                };
                Word::from_biguint(from_signed(&shifted, *bits), *bits)
            }
            _ => Word::from_bv(self.to_bv(ctx).bvashr(&shift.to_bv(ctx))),
        }
    }

    //
    // comparisons
    //

    pub fn eq(&self, other: &Self, ctx: &'ctx Context) -> SymBool<'ctx> {
        match (self, other) {
            (Word::Con { value: a, .. }, Word::Con { value: b, .. }) => SymBool::Con(a == b),
            _ => SymBool::from_z3(self.to_bv(ctx)._eq(&other.to_bv(ctx))),
        }
    }

    pub fn ult(&self, other: &Self, ctx: &'ctx Context) -> SymBool<'ctx> {
        match (self, other) {
            (Word::Con { value: a, .. }, Word::Con { value: b, .. }) => SymBool::Con(a < b),
            _ => SymBool::from_z3(self.to_bv(ctx).bvult(&other.to_bv(ctx))),
        }
    }

    pub fn ugt(&self, other: &Self, ctx: &'ctx Context) -> SymBool<'ctx> {
        match (self, other) {
            (Word::Con { value: a, .. }, Word::Con { value: b, .. }) => SymBool::Con(a > b),
            _ => SymBool::from_z3(self.to_bv(ctx).bvugt(&other.to_bv(ctx))),
        }
    }

    pub fn slt(&self, other: &Self, ctx: &'ctx Context) -> SymBool<'ctx> {
        match (self, other) {
            (Word::Con { value: a, bits }, Word::Con { value: b, .. }) => {
                SymBool::Con(as_signed(a, *bits) < as_signed(b, *bits))
            }
            _ => SymBool::from_z3(self.to_bv(ctx).bvslt(&other.to_bv(ctx))),
        }
    }

    pub fn sgt(&self, other: &Self, ctx: &'ctx Context) -> SymBool<'ctx> {
        match (self, other) {
            (Word::Con { value: a, bits }, Word::Con { value: b, .. }) => {
                SymBool::Con(as_signed(a, *bits) > as_signed(b, *bits))
            }
            _ => SymBool::from_z3(self.to_bv(ctx).bvsgt(&other.to_bv(ctx))),
        }
    }

    pub fn is_zero(&self, ctx: &'ctx Context) -> SymBool<'ctx> {
        match self {
            Word::Con { value, .. } => SymBool::Con(value.is_zero()),
            Word::Sym { term, bits } => {
                let zero = BV::from_u64(ctx, 0, *bits);
                SymBool::from_z3(term._eq(&zero))
            }
        }
    }

    //
    // width changes
    //

    pub fn zero_ext(&self, new_bits: u32, _ctx: &'ctx Context) -> Self {
        debug_assert!(new_bits >= self.bits());
        if new_bits == self.bits() {
            return self.clone();
        }
        match self {
            Word::Con { value, .. } => Word::from_biguint(value.clone(), new_bits),
            Word::Sym { term, bits } => Word::from_bv(term.zero_ext(new_bits - bits)),
        }
    }

    pub fn extract_low(&self, new_bits: u32, ctx: &'ctx Context) -> Self {
        debug_assert!(new_bits <= self.bits());
        if new_bits == self.bits() {
            return self.clone();
        }
        match self {
            Word::Con { value, .. } => Word::from_biguint(value.clone(), new_bits),
            Word::Sym { .. } => Word::from_bv(self.to_bv(ctx).extract(new_bits - 1, 0)),
        }
    }

    /// self becomes the high bits, other the low bits.
    pub fn concat(&self, other: &Self, ctx: &'ctx Context) -> Self {
        let new_bits = self.bits() + other.bits();
        match (self, other) {
            (Word::Con { value: a, .. }, Word::Con { value: b, bits: b_bits }) => {
                Word::from_biguint((a << *b_bits as usize) | b, new_bits)
            }
            _ => Word::from_bv(self.to_bv(ctx).concat(&other.to_bv(ctx))),
        }
    }

    /// Conditional word, folding a concrete condition.
    pub fn ite(cond: &SymBool<'ctx>, then: &Self, otherwise: &Self, ctx: &'ctx Context) -> Self {
        debug_assert_eq!(then.bits(), otherwise.bits());
        match cond {
            SymBool::Con(true) => then.clone(),
            SymBool::Con(false) => otherwise.clone(),
            SymBool::Sym(c) => Word::from_bv(c.ite(&then.to_bv(ctx), &otherwise.to_bv(ctx))),
        }
    }
}

impl<'ctx> fmt::Debug for Word<'ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Word::Con { value, bits } => write!(f, "W({:#x}, {})", value, bits),
            Word::Sym { term, bits } => write!(f, "W({}, {})", term, bits),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use z3::{Config, Context};

    fn ctx() -> Context {
        Context::new(&Config::new())
    }

    fn w<'ctx>(v: u64) -> Word<'ctx> {
        Word::con(v)
    }

    #[test]
    fn test_add_wraps() {
        let ctx = ctx();
        let max = Word::from_biguint(mask(256), 256);
        let one = Word::con(1);
        let sum = max.add_with(&one, &ctx, None);
        assert_eq!(sum.as_u64(), Some(0));
    }

    #[test]
    fn test_sub_wraps() {
        let ctx = ctx();
        let diff = w(0).sub_with(&w(1), &ctx, None);
        assert_eq!(diff.as_biguint(), Some(&mask(256)));
    }

    #[test]
    fn test_div_mod_by_zero() {
        let ctx = ctx();
        assert_eq!(w(7).udiv_with(&w(0), &ctx, None).as_u64(), Some(0));
        assert_eq!(w(7).urem_with(&w(0), &ctx, None).as_u64(), Some(0));
        assert_eq!(w(7).sdiv_with(&w(0), &ctx, None).as_u64(), Some(0));
        assert_eq!(w(7).srem_with(&w(0), &ctx, None).as_u64(), Some(0));
    }

    #[test]
    fn test_sdiv_negative() {
        let ctx = ctx();
        // -8 / 3 = -2 (truncated toward zero)
        let minus_8 = w(0).sub_with(&w(8), &ctx, None);
        let q = minus_8.sdiv_with(&w(3), &ctx, None);
        let minus_2 = w(0).sub_with(&w(2), &ctx, None);
        assert_eq!(q.as_biguint(), minus_2.as_biguint());

        // -8 % 3 = -2 (sign follows the dividend)
        let r = minus_8.srem_with(&w(3), &ctx, None);
        assert_eq!(r.as_biguint(), minus_2.as_biguint());
    }

    #[test]
    fn test_exp_zero_zero_is_one() {
        let ctx = ctx();
        let exp = FuncDecl::new(
            &ctx,
            "f_evm_exp",
            &[&z3::Sort::bitvector(&ctx, 256), &z3::Sort::bitvector(&ctx, 256)],
            &z3::Sort::bitvector(&ctx, 256),
        );
        let r = w(0).exp_with(&w(0), &ctx, &exp, None, 2);
        assert_eq!(r.as_u64(), Some(1));

        let r = w(2).exp_with(&w(10), &ctx, &exp, None, 2);
        assert_eq!(r.as_u64(), Some(1024));
    }

    #[test]
    fn test_exp_unrolls_to_mul() {
        let ctx = ctx();
        let exp = FuncDecl::new(
            &ctx,
            "f_evm_exp",
            &[&z3::Sort::bitvector(&ctx, 256), &z3::Sort::bitvector(&ctx, 256)],
            &z3::Sort::bitvector(&ctx, 256),
        );
        let x = Word::fresh(&ctx, "x", 256);
        // exponent 2 within the bound: x * x, not f_evm_exp
        let r = x.exp_with(&w(2), &ctx, &exp, None, 2);
        assert!(!r.to_bv(&ctx).to_string().contains("f_evm_exp"));
        // exponent 3 beyond the bound: falls back to the UF
        let r = x.exp_with(&w(3), &ctx, &exp, None, 2);
        assert!(r.to_bv(&ctx).to_string().contains("f_evm_exp"));
    }

    #[test]
    fn test_signextend() {
        let ctx = ctx();
        // sign-extending 0xff from byte 0 gives -1
        let r = Word::con(0xff).signextend(0, &ctx);
        assert_eq!(r.as_biguint(), Some(&mask(256)));

        // 0x7f stays positive
        let r = Word::con(0x7f).signextend(0, &ctx);
        assert_eq!(r.as_u64(), Some(0x7f));

        // index >= 31 is the identity
        let r = Word::con(0x1234).signextend(31, &ctx);
        assert_eq!(r.as_u64(), Some(0x1234));
    }

    #[test]
    fn test_shifts() {
        let ctx = ctx();
        assert_eq!(w(1).shl(&w(4), &ctx).as_u64(), Some(16));
        assert_eq!(w(16).lshr(&w(4), &ctx).as_u64(), Some(1));
        assert_eq!(w(1).shl(&w(256), &ctx).as_u64(), Some(0));

        // SAR on a negative value fills with ones
        let minus_4 = w(0).sub_with(&w(4), &ctx, None);
        let r = minus_4.ashr(&w(1), &ctx);
        let minus_2 = w(0).sub_with(&w(2), &ctx, None);
        assert_eq!(r.as_biguint(), minus_2.as_biguint());
    }

    #[test]
    fn test_signed_comparisons() {
        let ctx = ctx();
        let minus_1 = w(0).sub_with(&w(1), &ctx, None);
        assert!(minus_1.slt(&w(0), &ctx).is_true());
        assert!(w(0).sgt(&minus_1, &ctx).is_true());
        assert!(minus_1.ugt(&w(0), &ctx).is_true());
    }

    #[test]
    fn test_byte_extraction() {
        let ctx = ctx();
        let word = Word::from_bytes(&[0xAB; 1], 256);
        assert_eq!(word.byte(31, &ctx).as_con(), Some(0xAB));
        assert_eq!(word.byte(0, &ctx).as_con(), Some(0));
        assert_eq!(word.byte(40, &ctx).as_con(), Some(0));
    }

    #[test]
    fn test_addmod_mulmod() {
        let ctx = ctx();
        assert_eq!(w(10).addmod(&w(10), &w(8), &ctx).as_u64(), Some(4));
        assert_eq!(w(10).mulmod(&w(10), &w(8), &ctx).as_u64(), Some(4));
        assert_eq!(w(10).addmod(&w(10), &w(0), &ctx).as_u64(), Some(0));

        // the widened intermediate must not lose the carry
        let max = Word::from_biguint(mask(256), 256);
        let r = max.addmod(&max, &w(7), &ctx);
        let expected = (mask(256) + mask(256)) % BigUint::from(7u8);
        assert_eq!(r.as_biguint(), Some(&expected));
    }

    #[test]
    fn test_mul_by_power_of_two_becomes_shift() {
        let ctx = ctx();
        let x = Word::fresh(&ctx, "x", 256);
        let r = x.mul_with(&w(8), &ctx, None);
        let printed = r.to_bv(&ctx).to_string();
        assert!(printed.contains("bvshl"), "got: {}", printed);
    }

    #[test]
    fn test_uf_dispatch() {
        let ctx = ctx();
        let mul = FuncDecl::new(
            &ctx,
            "f_evm_mul",
            &[&z3::Sort::bitvector(&ctx, 256), &z3::Sort::bitvector(&ctx, 256)],
            &z3::Sort::bitvector(&ctx, 256),
        );
        let x = Word::fresh(&ctx, "x", 256);
        let y = Word::fresh(&ctx, "y", 256);
        let r = x.mul_with(&y, &ctx, Some(&mul));
        assert!(r.to_bv(&ctx).to_string().contains("f_evm_mul"));

        // concrete operands fold regardless of dispatch
        let r = w(6).mul_with(&w(7), &ctx, Some(&mul));
        assert_eq!(r.as_u64(), Some(42));
    }

    #[test]
    fn test_fingerprint_is_structural() {
        let ctx = ctx();
        let a = Word::fresh(&ctx, "x", 256).add_with(&w(1), &ctx, None);
        let b = Word::fresh(&ctx, "x", 256).add_with(&w(1), &ctx, None);
        let c = Word::fresh(&ctx, "y", 256).add_with(&w(1), &ctx, None);
        assert_eq!(a.fingerprint(&ctx), b.fingerprint(&ctx));
        assert_ne!(a.fingerprint(&ctx), c.fingerprint(&ctx));
    }

    #[test]
    fn test_ite_folds_concrete() {
        let ctx = ctx();
        let r = Word::ite(&SymBool::Con(true), &w(1), &w(2), &ctx);
        assert_eq!(r.as_u64(), Some(1));
        let r = Word::ite(&SymBool::Con(false), &w(1), &w(2), &ctx);
        assert_eq!(r.as_u64(), Some(2));
    }
}
