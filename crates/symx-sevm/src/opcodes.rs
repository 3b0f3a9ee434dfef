// SPDX-License-Identifier: AGPL-3.0

//! Opcode transfer functions.
//!
//! `step` executes one non-branching opcode in place and reports whether
//! the state halted. JUMPI is handled by `jumpi`, which performs the
//! per-side feasibility checks, enforces the loop bound, and forks the
//! state.

use z3::SatResult;

use symx_constants::{DSTEST_FAILED_SLOT, HEVM_ADDRESS, HEVM_STORE_SELECTOR};
use symx_errors::{SymxError, SymxResult};
use symx_program::*;
use symx_word::{SymBool, SymByte, Word};

use crate::{BranchTaken, CallRecord, Exec, LogRecord, Sevm, StorageAccount, Worklist};

impl<'ctx> Sevm<'ctx> {
    /// Execute one opcode. Returns true when the state halted.
    pub(crate) fn step(&self, ex: &mut Exec<'ctx>, insn: &Instruction) -> SymxResult<bool> {
        let ctx = self.ctx;

        match insn.opcode {
            //
            // arithmetic
            //
            OP_ADD => {
                let a = ex.pop()?;
                let b = ex.pop()?;
                let r = a.add_with(&b, ctx, self.add_uf());
                ex.push(r)?;
            }
            OP_SUB => {
                let a = ex.pop()?;
                let b = ex.pop()?;
                let r = a.sub_with(&b, ctx, self.sub_uf());
                ex.push(r)?;
            }
            OP_MUL => {
                let a = ex.pop()?;
                let b = ex.pop()?;
                let r = a.mul_with(&b, ctx, self.mul_uf());
                ex.push(r)?;
            }
            OP_DIV => {
                let a = ex.pop()?;
                let b = ex.pop()?;
                let r = a.udiv_with(&b, ctx, self.div_uf(&b));
                ex.push(r)?;
            }
            OP_SDIV => {
                let a = ex.pop()?;
                let b = ex.pop()?;
                let r = a.sdiv_with(&b, ctx, self.sdiv_uf());
                ex.push(r)?;
            }
            OP_MOD => {
                let a = ex.pop()?;
                let b = ex.pop()?;
                let r = a.urem_with(&b, ctx, self.rem_uf(&b));
                ex.push(r)?;
            }
            OP_SMOD => {
                let a = ex.pop()?;
                let b = ex.pop()?;
                let r = a.srem_with(&b, ctx, Some(&self.ufs.smod));
                ex.push(r)?;
            }
            OP_ADDMOD => {
                let a = ex.pop()?;
                let b = ex.pop()?;
                let n = ex.pop()?;
                ex.push(a.addmod(&b, &n, ctx))?;
            }
            OP_MULMOD => {
                let a = ex.pop()?;
                let b = ex.pop()?;
                let n = ex.pop()?;
                ex.push(a.mulmod(&b, &n, ctx))?;
            }
            OP_EXP => {
                let base = ex.pop()?;
                let exponent = ex.pop()?;
                let r = base.exp_with(
                    &exponent,
                    ctx,
                    &self.ufs.exp,
                    self.mul_uf(),
                    self.smt.exp_by_const,
                );
                ex.push(r)?;
            }
            OP_SIGNEXTEND => {
                let index = ex.pop()?;
                let value = ex.pop()?;
                let r = if index.is_con() {
                    match index.as_u64() {
                        Some(i) => value.signextend(i.min(31) as u32, ctx),
                        None => value, // index >= 31 is the identity
                    }
                } else {
                    return Err(SymxError::NotConcrete("SIGNEXTEND index".to_string()));
                };
                ex.push(r)?;
            }

            //
            // comparison and bitwise
            //
            OP_LT => {
                let a = ex.pop()?;
                let b = ex.pop()?;
                ex.push(a.ult(&b, ctx).to_word(ctx))?;
            }
            OP_GT => {
                let a = ex.pop()?;
                let b = ex.pop()?;
                ex.push(a.ugt(&b, ctx).to_word(ctx))?;
            }
            OP_SLT => {
                let a = ex.pop()?;
                let b = ex.pop()?;
                ex.push(a.slt(&b, ctx).to_word(ctx))?;
            }
            OP_SGT => {
                let a = ex.pop()?;
                let b = ex.pop()?;
                ex.push(a.sgt(&b, ctx).to_word(ctx))?;
            }
            OP_EQ => {
                let a = ex.pop()?;
                let b = ex.pop()?;
                ex.push(a.eq(&b, ctx).to_word(ctx))?;
            }
            OP_ISZERO => {
                let a = ex.pop()?;
                ex.push(a.is_zero(ctx).to_word(ctx))?;
            }
            OP_AND => {
                let a = ex.pop()?;
                let b = ex.pop()?;
                ex.push(a.and(&b, ctx))?;
            }
            OP_OR => {
                let a = ex.pop()?;
                let b = ex.pop()?;
                ex.push(a.or(&b, ctx))?;
            }
            OP_XOR => {
                let a = ex.pop()?;
                let b = ex.pop()?;
                ex.push(a.xor(&b, ctx))?;
            }
            OP_NOT => {
                let a = ex.pop()?;
                ex.push(a.not(ctx))?;
            }
            OP_BYTE => {
                let index = ex.pop()?;
                let value = ex.pop()?;
                let r = match index.as_u64() {
                    Some(i) if i < 32 => {
                        let shift = Word::con((31 - i) * 8);
                        value.lshr(&shift, ctx).and(&Word::con(0xff), ctx)
                    }
                    _ if index.is_con() => Word::con(0),
                    _ => {
                        let shift = Word::con(31)
                            .sub_with(&index, ctx, None)
                            .mul_with(&Word::con(8), ctx, None);
                        let byte = value.lshr(&shift, ctx).and(&Word::con(0xff), ctx);
                        let in_range = index.ult(&Word::con(32), ctx);
                        Word::ite(&in_range, &byte, &Word::con(0), ctx)
                    }
                };
                ex.push(r)?;
            }
            OP_SHL => {
                let shift = ex.pop()?;
                let value = ex.pop()?;
                ex.push(value.shl(&shift, ctx))?;
            }
            OP_SHR => {
                let shift = ex.pop()?;
                let value = ex.pop()?;
                ex.push(value.lshr(&shift, ctx))?;
            }
            OP_SAR => {
                let shift = ex.pop()?;
                let value = ex.pop()?;
                ex.push(value.ashr(&shift, ctx))?;
            }

            OP_SHA3 => {
                let offset = ex.pop()?.as_usize("SHA3 offset")?;
                let len = ex.pop()?.as_usize("SHA3 length")?;
                let bytes = ex.memory.read_bytes(offset, len);
                let hash = self.sha3_word(ex, &bytes);
                ex.push(hash)?;
            }

            //
            // environment
            //
            OP_ADDRESS => {
                let this = ex.this.clone();
                ex.push(this)?;
            }
            OP_BALANCE => {
                ex.pop()?;
                let fresh = ex.fresh_word(ctx, "balance");
                ex.push(fresh)?;
            }
            OP_ORIGIN => {
                let fresh = ex.fresh_word(ctx, "origin");
                ex.push(fresh)?;
            }
            OP_CALLER => {
                let caller = ex.caller.clone();
                ex.push(caller)?;
            }
            OP_CALLVALUE => {
                let callvalue = ex.callvalue.clone();
                ex.push(callvalue)?;
            }
            OP_CALLDATALOAD => {
                let offset = ex.pop()?;
                let word = ex.calldata.load_word(&offset, ctx);
                ex.push(word)?;
            }
            OP_CALLDATASIZE => {
                ex.push(Word::con(ex.calldata.size() as u64))?;
            }
            OP_CALLDATACOPY => {
                let dst = ex.pop()?.as_usize("CALLDATACOPY destination")?;
                let src = ex.pop()?.as_usize("CALLDATACOPY offset")?;
                let len = ex.pop()?.as_usize("CALLDATACOPY length")?;
                let bytes: Vec<SymByte<'ctx>> =
                    (0..len).map(|i| ex.calldata.byte_at(src + i, ctx)).collect();
                ex.memory.write_bytes(dst, &bytes)?;
            }
            OP_CODESIZE => {
                let size = ex
                    .program(ctx)
                    .map(|p| p.code_len())
                    .unwrap_or(0);
                ex.push(Word::con(size as u64))?;
            }
            OP_CODECOPY => {
                let dst = ex.pop()?.as_usize("CODECOPY destination")?;
                let src = ex.pop()?.as_usize("CODECOPY offset")?;
                let len = ex.pop()?.as_usize("CODECOPY length")?;
                let program = ex
                    .program(ctx)
                    .ok_or_else(|| SymxError::Internal("no current program".to_string()))?;
                let bytes: Vec<SymByte<'ctx>> = (0..len)
                    .map(|i| SymByte::Con(program.code_byte(src + i)))
                    .collect();
                ex.memory.write_bytes(dst, &bytes)?;
            }
            OP_GASPRICE => {
                let fresh = ex.fresh_word(ctx, "gasprice");
                ex.push(fresh)?;
            }
            OP_EXTCODESIZE => {
                ex.pop()?;
                let fresh = ex.fresh_word(ctx, "extcodesize");
                ex.push(fresh)?;
            }
            OP_EXTCODECOPY => {
                ex.pop()?;
                let dst = ex.pop()?.as_usize("EXTCODECOPY destination")?;
                let _src = ex.pop()?.as_usize("EXTCODECOPY offset")?;
                let len = ex.pop()?.as_usize("EXTCODECOPY length")?;
                let chunk = ex.fresh_word(ctx, "extcode");
                let bytes: Vec<SymByte<'ctx>> =
                    (0..len).map(|i| chunk.byte(i % 32, ctx)).collect();
                ex.memory.write_bytes(dst, &bytes)?;
            }
            OP_RETURNDATASIZE => {
                let size = ex.returndata.as_ref().map_or(0, |d| d.len());
                ex.push(Word::con(size as u64))?;
            }
            OP_RETURNDATACOPY => {
                let dst = ex.pop()?.as_usize("RETURNDATACOPY destination")?;
                let src = ex.pop()?.as_usize("RETURNDATACOPY offset")?;
                let len = ex.pop()?.as_usize("RETURNDATACOPY length")?;
                let empty = Vec::new();
                let data = ex.returndata.as_ref().unwrap_or(&empty);
                let bytes: Vec<SymByte<'ctx>> = (0..len)
                    .map(|i| data.get(src + i).cloned().unwrap_or(SymByte::Con(0)))
                    .collect();
                ex.memory.write_bytes(dst, &bytes)?;
            }
            OP_EXTCODEHASH => {
                ex.pop()?;
                let fresh = ex.fresh_word(ctx, "extcodehash");
                ex.push(fresh)?;
            }

            //
            // block
            //
            OP_BLOCKHASH => {
                ex.pop()?;
                let fresh = ex.fresh_word(ctx, "blockhash");
                ex.push(fresh)?;
            }
            OP_COINBASE => {
                let fresh = ex.fresh_word(ctx, "coinbase");
                ex.push(fresh)?;
            }
            OP_TIMESTAMP => {
                let fresh = ex.fresh_word(ctx, "timestamp");
                ex.push(fresh)?;
            }
            OP_NUMBER => {
                let fresh = ex.fresh_word(ctx, "blocknumber");
                ex.push(fresh)?;
            }
            OP_DIFFICULTY => {
                let fresh = ex.fresh_word(ctx, "difficulty");
                ex.push(fresh)?;
            }
            OP_GASLIMIT => {
                let fresh = ex.fresh_word(ctx, "gaslimit");
                ex.push(fresh)?;
            }
            OP_CHAINID => {
                let fresh = ex.fresh_word(ctx, "chainid");
                ex.push(fresh)?;
            }
            OP_SELFBALANCE => {
                let fp = ex.this_fp(ctx);
                let balance = ex.balance.get(&fp).cloned().unwrap_or_else(|| Word::con(0));
                ex.push(balance)?;
            }
            OP_BASEFEE => {
                let fresh = ex.fresh_word(ctx, "basefee");
                ex.push(fresh)?;
            }
            OP_GAS => {
                let fresh = ex.fresh_word(ctx, "gas");
                ex.push(fresh)?;
            }

            //
            // memory
            //
            OP_MLOAD => {
                let offset = ex.pop()?;
                let word = ex.memory.load_word(&offset, ctx)?;
                ex.push(word)?;
            }
            OP_MSTORE => {
                let offset = ex.pop()?;
                let value = ex.pop()?;
                ex.memory.store_word(&offset, value, ctx)?;
            }
            OP_MSTORE8 => {
                let offset = ex.pop()?;
                let value = ex.pop()?;
                ex.memory.store_byte(&offset, value.byte(31, ctx))?;
            }
            OP_MSIZE => {
                ex.push(Word::con(ex.memory.msize() as u64))?;
            }

            //
            // storage
            //
            OP_SLOAD => {
                let key = ex.pop()?;
                let value = self.sload(ex, &key);
                ex.push(value)?;
            }
            OP_SSTORE => {
                let key = ex.pop()?;
                let value = ex.pop()?;
                let fp = ex.this_fp(ctx);
                let account = ex
                    .storage
                    .entry(fp)
                    .or_insert_with(|| StorageAccount::new(ctx, fp));
                account.store(&key, &value, ctx);
            }

            //
            // flow
            //
            OP_JUMP => {
                let target = ex.pop()?.as_usize("jump target")?;
                let program = ex
                    .program(ctx)
                    .ok_or_else(|| SymxError::Internal("no current program".to_string()))?;
                if !program.is_jumpdest(target) {
                    return Err(SymxError::InvalidJumpDest(target));
                }
                ex.pc = target;
                return Ok(false);
            }
            OP_PC => {
                ex.push(Word::con(insn.pc as u64))?;
            }
            OP_JUMPDEST => {}
            OP_STOP => {
                ex.output = None;
                return Ok(true);
            }
            OP_RETURN | OP_REVERT => {
                let offset = ex.pop()?.as_usize("output offset")?;
                let len = ex.pop()?.as_usize("output length")?;
                ex.output = Some(ex.memory.read_bytes(offset, len));
                return Ok(true);
            }
            OP_INVALID => {
                return Ok(true);
            }
            OP_SELFDESTRUCT => {
                ex.pop()?;
                ex.output = None;
                return Ok(true);
            }

            //
            // stack
            //
            OP_POP => {
                ex.pop()?;
            }
            OP_PUSH0 => {
                ex.push(Word::con(0))?;
            }
            op @ OP_PUSH1..=OP_PUSH32 => {
                let operand = insn
                    .operand
                    .as_ref()
                    .ok_or_else(|| SymxError::Internal(format!("{} without operand", mnemonic(op))))?;
                ex.push(Word::from_bytes(operand, 256))?;
            }
            op @ OP_DUP1..=OP_DUP16 => {
                let n = (op - OP_DUP1 + 1) as usize;
                let value = ex.peek(n)?;
                ex.push(value)?;
            }
            op @ OP_SWAP1..=OP_SWAP16 => {
                let n = (op - OP_SWAP1 + 1) as usize;
                let len = ex.stack.len();
                if len < n + 1 {
                    return Err(SymxError::StackUnderflow);
                }
                ex.stack.swap(len - 1, len - 1 - n);
            }

            //
            // logs
            //
            op @ OP_LOG0..=OP_LOG4 => {
                let offset = ex.pop()?.as_usize("LOG offset")?;
                let len = ex.pop()?.as_usize("LOG length")?;
                let topic_count = (op - OP_LOG0) as usize;
                let mut topics = Vec::with_capacity(topic_count);
                for _ in 0..topic_count {
                    topics.push(ex.pop()?);
                }
                let data = ex.memory.read_bytes(offset, len);
                ex.log.push(LogRecord { topics, data });
            }

            //
            // system
            //
            OP_CALL | OP_CALLCODE => self.call_op(ex, insn.opcode, true)?,
            OP_DELEGATECALL | OP_STATICCALL => self.call_op(ex, insn.opcode, false)?,
            OP_CREATE => {
                ex.pop()?;
                ex.pop()?;
                ex.pop()?;
                let address = ex.fresh_word(ctx, "create_address");
                ex.calls.push(CallRecord {
                    op: "CREATE".to_string(),
                    target: address.clone(),
                    success: address.clone(),
                });
                ex.push(address)?;
            }
            OP_CREATE2 => {
                ex.pop()?;
                ex.pop()?;
                ex.pop()?;
                ex.pop()?;
                let address = ex.fresh_word(ctx, "create2_address");
                ex.calls.push(CallRecord {
                    op: "CREATE2".to_string(),
                    target: address.clone(),
                    success: address.clone(),
                });
                ex.push(address)?;
            }

            op => {
                return Err(SymxError::NotSupported(mnemonic(op)));
            }
        }

        ex.pc = insn.next_pc;
        Ok(false)
    }

    /// SLOAD through the named-read-constant cache.
    fn sload(&self, ex: &mut Exec<'ctx>, key: &Word<'ctx>) -> Word<'ctx> {
        use z3::ast::Ast;
        let ctx = self.ctx;
        let fp = ex.this_fp(ctx);
        let account = ex
            .storage
            .entry(fp)
            .or_insert_with(|| StorageAccount::new(ctx, fp));

        let name = account.read_name(key, ctx);
        let select = account.select(key, ctx);

        if let Some(word) = ex.storage_reads.get(&name) {
            return word.clone();
        }
        let word = Word::fresh(ctx, &name, 256);
        let tie = word.to_bv(ctx)._eq(&select.to_bv(ctx));
        ex.path.assert(tie, false);
        ex.storage_reads.insert(name, word.clone());
        word
    }

    /// CALL/CALLCODE/DELEGATECALL/STATICCALL: the destination is not
    /// re-entered; a fresh success flag and fresh return data stand in
    /// for the callee.
    fn call_op(&self, ex: &mut Exec<'ctx>, opcode: u8, has_value: bool) -> SymxResult<()> {
        let ctx = self.ctx;
        let _gas = ex.pop()?;
        let target = ex.pop()?;
        if has_value {
            ex.pop()?;
        }
        let in_offset = ex.pop()?;
        let in_len = ex.pop()?;
        let ret_offset = ex.pop()?;
        let ret_len = ex.pop()?;

        if opcode == OP_CALL && is_hevm_address(&target) {
            self.check_dstest_fail(ex, &in_offset, &in_len);
        }

        let success = ex.fresh_word(ctx, "call_success");
        let ret = ex.fresh_word(ctx, "call_returndata");
        let ret_bytes: Vec<SymByte<'ctx>> = (0..32).map(|i| ret.byte(i, ctx)).collect();

        if let (Some(dst), Some(len)) = (ret_offset.as_u64(), ret_len.as_u64()) {
            let n = (len as usize).min(32);
            ex.memory.write_bytes(dst as usize, &ret_bytes[..n])?;
        }
        ex.returndata = Some(ret_bytes);

        ex.calls.push(CallRecord {
            op: mnemonic(opcode),
            target,
            success: success.clone(),
        });
        ex.push(success)?;
        Ok(())
    }

    /// DSTest's fail() marks failure by storing into the "failed" slot
    /// of the hevm cheatcode address.
    fn check_dstest_fail(&self, ex: &mut Exec<'ctx>, in_offset: &Word<'ctx>, in_len: &Word<'ctx>) {
        let (Some(offset), Some(len)) = (in_offset.as_u64(), in_len.as_u64()) else {
            return;
        };
        if len < 4 + 96 {
            return;
        }
        let bytes = ex.memory.read_bytes(offset as usize, 4 + 96);
        let concrete: Option<Vec<u8>> = bytes.iter().map(|b| b.as_con()).collect();
        let Some(concrete) = concrete else { return };
        if concrete[0..4] != HEVM_STORE_SELECTOR {
            return;
        }
        // store(address, bytes32 slot, bytes32 value): the slot argument
        if concrete[36..68] == DSTEST_FAILED_SLOT {
            ex.failed = true;
        }
    }

    /// Branch on JUMPI. The continuing state (the jump-taken side, when
    /// followed) is returned; the other side goes onto the worklist.
    pub(crate) fn jumpi(
        &self,
        mut ex: Exec<'ctx>,
        insn: &Instruction,
        worklist: &mut Worklist<Exec<'ctx>>,
        terminals: &mut Vec<Exec<'ctx>>,
    ) -> Option<Exec<'ctx>> {
        let ctx = self.ctx;

        let popped = (|| -> SymxResult<(Word<'ctx>, Word<'ctx>)> {
            let dest = ex.pop()?;
            let cond = ex.pop()?;
            Ok((dest, cond))
        })();
        let (dest, cond) = match popped {
            Ok(popped) => popped,
            Err(err) => {
                ex.error = Some(err.to_string());
                terminals.push(ex);
                return None;
            }
        };

        let target = match dest.as_usize("jump target") {
            Ok(target) => target,
            Err(err) => {
                ex.error = Some(err.to_string());
                terminals.push(ex);
                return None;
            }
        };
        let valid = ex.program(ctx).map_or(false, |p| p.is_jumpdest(target));
        if !valid {
            ex.error = Some(SymxError::InvalidJumpDest(target).to_string());
            terminals.push(ex);
            return None;
        }

        match cond.is_zero(ctx) {
            SymBool::Con(true) => {
                ex.pc = insn.next_pc;
                Some(ex)
            }
            SymBool::Con(false) => {
                ex.pc = target;
                Some(ex)
            }
            SymBool::Sym(zero) => {
                let taken = zero.not();
                let counts = ex.jumpis.get(&insn.pc).copied().unwrap_or_default();

                // unsat prunes a side; unknown explores it (sound
                // over-approximation under the branching timeout)
                let feasible_taken = ex.path.check_cond(&taken) != SatResult::Unsat;
                let feasible_fallen = ex.path.check_cond(&zero) != SatResult::Unsat;

                let follow_taken = feasible_taken && counts.taken < self.explore.max_loop;
                let follow_fallen = feasible_fallen && counts.fallen < self.explore.max_loop;

                match (follow_taken, follow_fallen) {
                    (true, true) => {
                        let mut fallen = ex.clone();
                        fallen.path.assert(zero, true);
                        fallen.pc = insn.next_pc;
                        fallen
                            .jumpis
                            .entry(insn.pc)
                            .or_insert_with(BranchTaken::default)
                            .fallen += 1;
                        worklist.push(fallen);

                        ex.path.assert(taken, true);
                        ex.pc = target;
                        ex.jumpis
                            .entry(insn.pc)
                            .or_insert_with(BranchTaken::default)
                            .taken += 1;
                        Some(ex)
                    }
                    (true, false) => {
                        ex.path.assert(taken, true);
                        ex.pc = target;
                        ex.jumpis
                            .entry(insn.pc)
                            .or_insert_with(BranchTaken::default)
                            .taken += 1;
                        Some(ex)
                    }
                    (false, true) => {
                        ex.path.assert(zero, true);
                        ex.pc = insn.next_pc;
                        ex.jumpis
                            .entry(insn.pc)
                            .or_insert_with(BranchTaken::default)
                            .fallen += 1;
                        Some(ex)
                    }
                    (false, false) => None,
                }
            }
        }
    }
}

fn is_hevm_address(target: &Word<'_>) -> bool {
    match target.to_bytes() {
        Some(bytes) => bytes.len() == 32 && bytes[12..] == HEVM_ADDRESS[..],
        None => false,
    }
}
