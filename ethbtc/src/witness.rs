//! A small, deterministic witness evaluator.
//!
//! It understands exactly the scripts this crate produces: P2WPKH spends of
//! the funder's wallet and both branches of the HTLC witness script. Every
//! transaction the engine signs is run through [`verify_spend`] before it is
//! handed out, which catches a wrong sighash, a wrong branch selector or a
//! premature refund before the transaction ever reaches a node.

use crate::{timestamp::LOCKTIME_THRESHOLD, Timestamp, SECP};
use bitcoin::{
    blockdata::script::Builder,
    hashes::{hash160, sha256, Hash},
    secp256k1::{self, Message, PublicKey, Signature},
    util::bip143::SigHashCache,
    Script, SigHashType, Transaction, TxOut,
};
use std::convert::TryFrom;

pub const SIGHASH_ALL: u8 = 0x01;
const SEQUENCE_FINAL: u32 = 0xFFFF_FFFF;
const MAX_SCRIPT_NUM_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScriptError {
    #[error("input {0} does not exist")]
    NoSuchInput(usize),
    #[error("witness is empty")]
    EmptyWitness,
    #[error("script pubkey is neither P2WPKH nor P2WSH")]
    UnsupportedScriptPubkey,
    #[error("witness script does not hash to the witness program")]
    WitnessProgramMismatch,
    #[error("malformed script")]
    MalformedScript,
    #[error("opcode 0x{0:02x} is not supported")]
    UnsupportedOpcode(u8),
    #[error("stack underflow")]
    StackUnderflow,
    #[error("unbalanced conditional")]
    UnbalancedConditional,
    #[error("OP_IF argument must be empty or exactly 0x01")]
    MinimalIf,
    #[error("OP_EQUALVERIFY failed")]
    EqualVerify,
    #[error("OP_VERIFY failed")]
    Verify,
    #[error("signature is not DER encoded")]
    SignatureEncoding,
    #[error("sighash type 0x{0:02x} is not supported")]
    UnsupportedSighashType(u8),
    #[error("public key is invalid")]
    PublicKeyEncoding,
    #[error("signature check failed with a non-empty signature")]
    NullFail,
    #[error("script number overflows")]
    ScriptNumOverflow,
    #[error("negative locktime")]
    NegativeLocktime,
    #[error("locktime types of script and transaction differ")]
    LocktimeTypeMismatch,
    #[error("transaction locktime {actual} is below the required {required}")]
    LocktimeNotReached { required: u32, actual: u32 },
    #[error("input sequence disables locktime")]
    SequenceFinal,
    #[error("transaction locktime {lock_time} is later than chain time {chain_time}")]
    NotFinal {
        lock_time: u32,
        chain_time: Timestamp,
    },
    #[error("script evaluated to false")]
    EvalFalse,
    #[error("stack must contain exactly one element after evaluation")]
    CleanStack,
}

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Push(Vec<u8>),
    Code(u8),
}

mod opcode {
    pub const OP_PUSHDATA1: u8 = 0x4c;
    pub const OP_PUSHDATA2: u8 = 0x4d;
    pub const OP_PUSHDATA4: u8 = 0x4e;
    pub const OP_1NEGATE: u8 = 0x4f;
    pub const OP_1: u8 = 0x51;
    pub const OP_16: u8 = 0x60;
    pub const OP_IF: u8 = 0x63;
    pub const OP_NOTIF: u8 = 0x64;
    pub const OP_ELSE: u8 = 0x67;
    pub const OP_ENDIF: u8 = 0x68;
    pub const OP_VERIFY: u8 = 0x69;
    pub const OP_DROP: u8 = 0x75;
    pub const OP_DUP: u8 = 0x76;
    pub const OP_EQUAL: u8 = 0x87;
    pub const OP_EQUALVERIFY: u8 = 0x88;
    pub const OP_SHA256: u8 = 0xa8;
    pub const OP_HASH160: u8 = 0xa9;
    pub const OP_CHECKSIG: u8 = 0xac;
    pub const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;
}

fn parse(script: &[u8]) -> Result<Vec<Op>, ScriptError> {
    let mut ops = Vec::new();
    let mut i = 0;

    while i < script.len() {
        let code = script[i];
        i += 1;

        let len = match code {
            0x00 => {
                ops.push(Op::Push(vec![]));
                continue;
            }
            0x01..=0x4b => usize::from(code),
            opcode::OP_PUSHDATA1 => read_len(script, &mut i, 1)?,
            opcode::OP_PUSHDATA2 => read_len(script, &mut i, 2)?,
            opcode::OP_PUSHDATA4 => read_len(script, &mut i, 4)?,
            _ => {
                ops.push(Op::Code(code));
                continue;
            }
        };

        let data = script
            .get(i..i + len)
            .ok_or(ScriptError::MalformedScript)?;
        ops.push(Op::Push(data.to_vec()));
        i += len;
    }

    Ok(ops)
}

fn read_len(script: &[u8], i: &mut usize, width: usize) -> Result<usize, ScriptError> {
    let bytes = script
        .get(*i..*i + width)
        .ok_or(ScriptError::MalformedScript)?;
    *i += width;

    Ok(bytes
        .iter()
        .rev()
        .fold(0usize, |acc, byte| (acc << 8) | usize::from(*byte)))
}

fn is_true(data: &[u8]) -> bool {
    match data.split_last() {
        None => false,
        Some((last, rest)) => rest.iter().any(|b| *b != 0) || (*last != 0 && *last != 0x80),
    }
}

fn decode_num(data: &[u8]) -> Result<i64, ScriptError> {
    if data.len() > MAX_SCRIPT_NUM_LEN {
        return Err(ScriptError::ScriptNumOverflow);
    }

    let (last, _) = match data.split_last() {
        None => return Ok(0),
        Some(split) => split,
    };

    let negative = last & 0x80 != 0;
    let magnitude = data.iter().enumerate().fold(0i64, |acc, (i, byte)| {
        let byte = if i == data.len() - 1 {
            byte & 0x7f
        } else {
            *byte
        };
        acc | (i64::from(byte) << (8 * i))
    });

    Ok(if negative { -magnitude } else { magnitude })
}

/// BIP143 digest for spending `input_index` of `tx` with SIGHASH_ALL.
pub fn sighash(
    tx: &Transaction,
    input_index: usize,
    script_code: &Script,
    value: u64,
) -> Result<Message, secp256k1::Error> {
    let hash = SigHashCache::new(tx).signature_hash(
        input_index,
        script_code,
        value,
        SigHashType::All,
    );

    Message::from_slice(&hash[..])
}

/// The script code a P2WPKH input commits to in its signature.
pub fn p2wpkh_script_code(pubkey_hash: &[u8]) -> Script {
    Builder::new()
        .push_opcode(bitcoin::blockdata::opcodes::all::OP_DUP)
        .push_opcode(bitcoin::blockdata::opcodes::all::OP_HASH160)
        .push_slice(pubkey_hash)
        .push_opcode(bitcoin::blockdata::opcodes::all::OP_EQUALVERIFY)
        .push_opcode(bitcoin::blockdata::opcodes::all::OP_CHECKSIG)
        .into_script()
}

struct Interpreter<'a> {
    tx: &'a Transaction,
    input_index: usize,
    value: u64,
    script_code: &'a Script,
    stack: Vec<Vec<u8>>,
}

impl<'a> Interpreter<'a> {
    fn pop(&mut self) -> Result<Vec<u8>, ScriptError> {
        self.stack.pop().ok_or(ScriptError::StackUnderflow)
    }

    fn peek(&self) -> Result<&Vec<u8>, ScriptError> {
        self.stack.last().ok_or(ScriptError::StackUnderflow)
    }

    fn execute(&mut self, ops: &[Op]) -> Result<(), ScriptError> {
        let mut if_stack: Vec<bool> = Vec::new();

        for op in ops {
            let executing = if_stack.iter().all(|branch| *branch);

            match op {
                Op::Code(opcode::OP_IF) | Op::Code(opcode::OP_NOTIF) => {
                    if !executing {
                        if_stack.push(false);
                        continue;
                    }

                    let condition = self.pop()?;
                    if condition.len() > 1 || (condition.len() == 1 && condition[0] != 1) {
                        return Err(ScriptError::MinimalIf);
                    }

                    let taken = is_true(&condition);
                    if_stack.push(if *op == Op::Code(opcode::OP_IF) {
                        taken
                    } else {
                        !taken
                    });
                }
                Op::Code(opcode::OP_ELSE) => {
                    let branch = if_stack
                        .last_mut()
                        .ok_or(ScriptError::UnbalancedConditional)?;
                    *branch = !*branch;
                }
                Op::Code(opcode::OP_ENDIF) => {
                    if_stack.pop().ok_or(ScriptError::UnbalancedConditional)?;
                }

                _ if !executing => continue,

                Op::Push(data) => self.stack.push(data.clone()),
                Op::Code(opcode::OP_1NEGATE) => self.stack.push(vec![0x81]),
                Op::Code(code @ opcode::OP_1..=opcode::OP_16) => {
                    self.stack.push(vec![code - opcode::OP_1 + 1])
                }
                Op::Code(opcode::OP_VERIFY) => {
                    if !is_true(&self.pop()?) {
                        return Err(ScriptError::Verify);
                    }
                }
                Op::Code(opcode::OP_DROP) => {
                    self.pop()?;
                }
                Op::Code(opcode::OP_DUP) => {
                    let top = self.peek()?.clone();
                    self.stack.push(top);
                }
                Op::Code(opcode::OP_EQUAL) | Op::Code(opcode::OP_EQUALVERIFY) => {
                    let a = self.pop()?;
                    let b = self.pop()?;

                    if *op == Op::Code(opcode::OP_EQUALVERIFY) {
                        if a != b {
                            return Err(ScriptError::EqualVerify);
                        }
                    } else {
                        self.stack.push(if a == b { vec![1] } else { vec![] });
                    }
                }
                Op::Code(opcode::OP_SHA256) => {
                    let data = self.pop()?;
                    self.stack
                        .push(sha256::Hash::hash(&data).into_inner().to_vec());
                }
                Op::Code(opcode::OP_HASH160) => {
                    let data = self.pop()?;
                    self.stack
                        .push(hash160::Hash::hash(&data).into_inner().to_vec());
                }
                Op::Code(opcode::OP_CHECKSIG) => {
                    let pubkey = self.pop()?;
                    let signature = self.pop()?;

                    let valid = self.check_signature(&signature, &pubkey)?;
                    if !valid && !signature.is_empty() {
                        return Err(ScriptError::NullFail);
                    }

                    self.stack.push(if valid { vec![1] } else { vec![] });
                }
                Op::Code(opcode::OP_CHECKLOCKTIMEVERIFY) => {
                    let required = decode_num(self.peek()?)?;
                    self.check_lock_time(required)?;
                }
                Op::Code(code) => return Err(ScriptError::UnsupportedOpcode(*code)),
            }
        }

        if !if_stack.is_empty() {
            return Err(ScriptError::UnbalancedConditional);
        }

        Ok(())
    }

    fn check_signature(&self, signature: &[u8], pubkey: &[u8]) -> Result<bool, ScriptError> {
        let (sighash_type, der) = match signature.split_last() {
            None => return Ok(false),
            Some(split) => split,
        };

        if *sighash_type != SIGHASH_ALL {
            return Err(ScriptError::UnsupportedSighashType(*sighash_type));
        }

        let signature = Signature::from_der(der).map_err(|_| ScriptError::SignatureEncoding)?;
        let pubkey = PublicKey::from_slice(pubkey).map_err(|_| ScriptError::PublicKeyEncoding)?;

        let message = sighash(self.tx, self.input_index, self.script_code, self.value)
            .map_err(|_| ScriptError::MalformedScript)?;

        Ok(SECP.verify(&message, &signature, &pubkey).is_ok())
    }

    fn check_lock_time(&self, required: i64) -> Result<(), ScriptError> {
        if required < 0 {
            return Err(ScriptError::NegativeLocktime);
        }

        let threshold = i64::from(LOCKTIME_THRESHOLD);
        let actual = i64::from(self.tx.lock_time);

        if (required < threshold) != (actual < threshold) {
            return Err(ScriptError::LocktimeTypeMismatch);
        }

        if actual < required {
            return Err(ScriptError::LocktimeNotReached {
                required: u32::try_from(required).unwrap_or(u32::MAX),
                actual: self.tx.lock_time,
            });
        }

        let sequence = self
            .tx
            .input
            .get(self.input_index)
            .map(|input| input.sequence)
            .ok_or(ScriptError::NoSuchInput(self.input_index))?;

        if sequence == SEQUENCE_FINAL {
            return Err(ScriptError::SequenceFinal);
        }

        Ok(())
    }
}

/// Checks that input `input_index` of `tx` validly spends `prevout` at
/// `chain_time`.
///
/// `chain_time` stands in for the median time past of the chain tip and is
/// compared against time based transaction locktimes.
pub fn verify_spend(
    tx: &Transaction,
    input_index: usize,
    prevout: &TxOut,
    chain_time: Timestamp,
) -> Result<(), ScriptError> {
    let input = tx
        .input
        .get(input_index)
        .ok_or(ScriptError::NoSuchInput(input_index))?;

    check_finality(tx, chain_time)?;

    let program = prevout.script_pubkey.as_bytes();
    let (script_code, initial_stack, ops) = match program {
        // OP_0 <20 byte key hash>
        [0x00, 0x14, pubkey_hash @ ..] if pubkey_hash.len() == 20 => {
            let script_code = p2wpkh_script_code(pubkey_hash);
            let ops = parse(script_code.as_bytes())?;

            (script_code, input.witness.clone(), ops)
        }
        // OP_0 <32 byte script hash>
        [0x00, 0x20, script_hash @ ..] if script_hash.len() == 32 => {
            let (witness_script, stack) = input
                .witness
                .split_last()
                .ok_or(ScriptError::EmptyWitness)?;

            if sha256::Hash::hash(witness_script).into_inner()[..] != script_hash[..] {
                return Err(ScriptError::WitnessProgramMismatch);
            }

            let ops = parse(witness_script)?;

            (Script::from(witness_script.clone()), stack.to_vec(), ops)
        }
        _ => return Err(ScriptError::UnsupportedScriptPubkey),
    };

    if initial_stack.is_empty() {
        return Err(ScriptError::EmptyWitness);
    }

    let mut interpreter = Interpreter {
        tx,
        input_index,
        value: prevout.value,
        script_code: &script_code,
        stack: initial_stack,
    };

    interpreter.execute(&ops)?;

    match interpreter.stack.as_slice() {
        [top] if is_true(top) => Ok(()),
        [_] | [] => Err(ScriptError::EvalFalse),
        _ => Err(ScriptError::CleanStack),
    }
}

fn check_finality(tx: &Transaction, chain_time: Timestamp) -> Result<(), ScriptError> {
    let all_final = tx.input.iter().all(|input| input.sequence == SEQUENCE_FINAL);

    if tx.lock_time == 0 || all_final {
        return Ok(());
    }

    if tx.lock_time < LOCKTIME_THRESHOLD || Timestamp::from(tx.lock_time) > chain_time {
        return Err(ScriptError::NotFinal {
            lock_time: tx.lock_time,
            chain_time,
        });
    }

    Ok(())
}
