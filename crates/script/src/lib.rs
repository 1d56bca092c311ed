//! Script evaluation, signature hashing, sigop accounting, and standard templates.

pub mod interpreter;
pub mod opcodes;
mod secp;
pub mod sighash;
pub mod sigops;
pub mod standard;

pub use interpreter::{
    eval_script, verify_script, ScriptError, ScriptFlags, SignatureChecker, SCRIPT_VERIFY_NONE,
    SCRIPT_VERIFY_P2SH, SCRIPT_VERIFY_STRICTENC,
};
pub use opcodes::{is_push_only, is_unspendable};
pub use sighash::{signature_hash, SIGHASH_ALL, SIGHASH_ANYONECANPAY, SIGHASH_NONE, SIGHASH_SINGLE};
pub use sigops::{legacy_sigop_count, p2sh_sigop_count, script_sigop_count};
pub use standard::{
    is_input_standard, is_pay_to_script_hash, is_standard_script, script_sig_args_expected, solve,
    Solution,
};
