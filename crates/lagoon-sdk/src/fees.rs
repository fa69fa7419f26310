//! Virtual size and fee estimation for Elements transactions.
//!
//! Sizes are estimated from the script type of every input and the
//! confidentiality of every output. One extra unconfidential fee output is
//! always accounted for.

use lwk_wollet::elements::Script;

use crate::pset::{TxInput, TxOutput};

/// Fee amount targeted by the second coin-selection round of a transfer when
/// the estimated fee is smaller than this.
pub const DUMMY_FEE_AMOUNT: u64 = 700;

/// Default fee rate, in millisatoshi per byte.
pub const MIN_MILLISATS_PER_BYTE: u64 = 100;

// Scriptsig sizes, len prefix included.
const P2PK_SCRIPTSIG: usize = 140;
const P2PKH_SCRIPTSIG: usize = 108;
const P2SH_P2WPKH_SCRIPTSIG: usize = 23;
const SEGWIT_SCRIPTSIG: usize = 1;

// len + witness[sig, pubkey]
const DEFAULT_INPUT_WITNESS: usize = 1 + 107;
// no issuance proof + no token proof + no pegin witness
const INPUT_WITNESS_EXTRA: usize = 1 + 1 + 1;

// asset + explicit value + empty nonce
const EXPLICIT_OUTPUT: usize = 33 + 9 + 1;
// asset + value commitments + nonce
const CONFIDENTIAL_OUTPUT: usize = 33 + 33 + 33;
// no range proof + no surjection proof
const EXPLICIT_OUTPUT_WITNESS: usize = 1 + 1;
// len + range proof + len + surjection proof
const CONFIDENTIAL_OUTPUT_WITNESS: usize = 3 + 4174 + 1 + 131;

// asset + explicit value + empty script + empty nonce
const FEE_OUTPUT: usize = 33 + 9 + 1 + 1;
const FEE_OUTPUT_WITNESS: usize = 1 + 1;

fn script_sig_size(script: &[u8]) -> usize {
    let script = Script::from(script.to_vec());
    if script.is_v0_p2wpkh() || script.is_v0_p2wsh() {
        SEGWIT_SCRIPTSIG
    } else if script.is_p2sh() {
        P2SH_P2WPKH_SCRIPTSIG
    } else if script.is_p2pkh() {
        P2PKH_SCRIPTSIG
    } else {
        P2PK_SCRIPTSIG
    }
}

fn var_int_size(n: u64) -> usize {
    match n {
        0..0xfd => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

fn var_slice_size(data: &[u8]) -> usize {
    var_int_size(data.len() as u64) + data.len()
}

/// Estimated virtual size of a transaction spending `inputs` into `outputs`
/// plus a fee output.
pub fn estimate_tx_size(inputs: &[TxInput], outputs: &[TxOutput]) -> u64 {
    let mut base = 9 + var_int_size(inputs.len() as u64) + var_int_size(outputs.len() as u64 + 1);
    let mut witness = 0;

    for input in inputs {
        let script_sig = match input.script_sig_size {
            0 => script_sig_size(&input.script),
            n => n,
        };
        let input_witness = match input.witness_size {
            0 => DEFAULT_INPUT_WITNESS,
            n => n,
        };
        // hash + index + sequence
        base += 40 + script_sig;
        witness += input_witness + INPUT_WITNESS_EXTRA;
    }

    for output in outputs {
        let (size, output_witness) = if output.is_confidential() {
            (CONFIDENTIAL_OUTPUT, CONFIDENTIAL_OUTPUT_WITNESS)
        } else {
            (EXPLICIT_OUTPUT, EXPLICIT_OUTPUT_WITNESS)
        };
        base += size + var_slice_size(&output.script);
        witness += output_witness;
    }

    base += FEE_OUTPUT;
    witness += FEE_OUTPUT_WITNESS;

    let total = base + witness;
    let weight = base * 3 + total;
    weight.div_ceil(4) as u64
}

/// Fee for the estimated size at `millisats_per_byte`, rounded down.
pub fn estimate_fees(inputs: &[TxInput], outputs: &[TxOutput], millisats_per_byte: u64) -> u64 {
    estimate_tx_size(inputs, outputs) * millisats_per_byte / 1000
}

/// Rounds `amount` up at the scale of its leading digit: 47 -> 50,
/// 470 -> 500, 101 -> 200.
pub fn round_up(amount: u64) -> u64 {
    let mut scale: u64 = 1;
    while amount > scale.saturating_mul(10) {
        scale = scale.saturating_mul(10);
    }
    amount.div_ceil(scale) * scale
}
