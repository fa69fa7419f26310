//! Partial transaction construction, blinding and signing.
//!
//! The transaction services talk to a [`PsetBackend`]; [`LwkPsetBackend`] is
//! the implementation over the `elements` PSET v2 types re-exported by
//! lwk, with PSETs exchanged as base64 strings and transactions as hex.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use lwk_common::Signer;
use lwk_signer::SwSigner;
use lwk_wollet::bitcoin::bip32::DerivationPath;
use lwk_wollet::elements::confidential::{
    Asset, AssetBlindingFactor, Nonce, Value as ConfValue, ValueBlindingFactor,
};
use lwk_wollet::elements::encode::{deserialize, serialize};
use lwk_wollet::elements::pset::PartiallySignedTransaction;
use lwk_wollet::elements::secp256k1_zkp::{self, RangeProof, SurjectionProof};
use lwk_wollet::elements::{
    AssetId, Script, Sequence, Transaction, TxOut, TxOutSecrets, TxOutWitness, Txid,
};
use rand::thread_rng;

use crate::domain::{Utxo, UtxoKey};
use crate::error::{Error, Result};
use crate::network::Network;

/// A coin to be spent by a partial transaction: the prevout plus everything
/// needed to unblind it and to locate its signing key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxInput {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    pub asset: String,
    pub script: Vec<u8>,
    pub value_blinder: Vec<u8>,
    pub asset_blinder: Vec<u8>,
    pub value_commitment: Vec<u8>,
    pub asset_commitment: Vec<u8>,
    pub nonce: Vec<u8>,
    pub range_proof: Vec<u8>,
    pub surjection_proof: Vec<u8>,
    /// Path relative to the wallet root, empty for inputs not owned by us.
    pub derivation_path: String,
    /// Overrides for the fee model, 0 means "infer from the script type".
    pub script_sig_size: usize,
    pub witness_size: usize,
}

impl From<&Utxo> for TxInput {
    fn from(u: &Utxo) -> Self {
        Self {
            txid: u.key.txid.clone(),
            vout: u.key.vout,
            value: u.value,
            asset: u.asset.clone(),
            script: u.script.clone(),
            value_blinder: u.value_blinder.clone(),
            asset_blinder: u.asset_blinder.clone(),
            value_commitment: u.value_commitment.clone(),
            asset_commitment: u.asset_commitment.clone(),
            nonce: u.nonce.clone(),
            range_proof: u.range_proof.clone(),
            surjection_proof: u.surjection_proof.clone(),
            ..Default::default()
        }
    }
}

impl TxInput {
    pub fn key(&self) -> UtxoKey {
        UtxoKey::new(self.txid.clone(), self.vout)
    }

    /// The output being spent, confidential if commitments are known.
    pub fn prevout(&self) -> Result<TxOut> {
        let asset = if self.asset_commitment.is_empty() {
            Asset::Explicit(parse_asset(&self.asset)?)
        } else {
            Asset::from_commitment(&self.asset_commitment)
                .map_err(|e| Error::Pset(format!("asset commitment: {e}")))?
        };
        let value = if self.value_commitment.is_empty() {
            ConfValue::Explicit(self.value)
        } else {
            ConfValue::from_commitment(&self.value_commitment)
                .map_err(|e| Error::Pset(format!("value commitment: {e}")))?
        };
        let nonce = if self.nonce.is_empty() {
            Nonce::Null
        } else {
            Nonce::from_commitment(&self.nonce).map_err(|e| Error::Pset(format!("nonce: {e}")))?
        };

        let mut witness = TxOutWitness::default();
        if !self.range_proof.is_empty() {
            let proof = RangeProof::from_slice(&self.range_proof)
                .map_err(|e| Error::Pset(format!("range proof: {e}")))?;
            witness.rangeproof = Some(Box::new(proof));
        }
        if !self.surjection_proof.is_empty() {
            let proof = SurjectionProof::from_slice(&self.surjection_proof)
                .map_err(|e| Error::Pset(format!("surjection proof: {e}")))?;
            witness.surjection_proof = Some(Box::new(proof));
        }

        Ok(TxOut {
            asset,
            value,
            nonce,
            script_pubkey: Script::from(self.script.clone()),
            witness,
        })
    }

    /// Blinding secrets; zero factors for unconfidential coins.
    pub fn secrets(&self) -> Result<TxOutSecrets> {
        let asset_bf = if self.asset_blinder.is_empty() {
            AssetBlindingFactor::zero()
        } else {
            AssetBlindingFactor::from_slice(&self.asset_blinder)
                .map_err(|e| Error::Blinding(format!("ABF: {e}")))?
        };
        let value_bf = if self.value_blinder.is_empty() {
            ValueBlindingFactor::zero()
        } else {
            ValueBlindingFactor::from_slice(&self.value_blinder)
                .map_err(|e| Error::Blinding(format!("VBF: {e}")))?
        };
        Ok(TxOutSecrets {
            asset: parse_asset(&self.asset)?,
            asset_bf,
            value: self.value,
            value_bf,
        })
    }
}

/// A new output. An empty script makes it a fee output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxOutput {
    pub asset: String,
    pub amount: u64,
    pub script: Vec<u8>,
    /// Compressed blinding public key, empty for unconfidential outputs.
    pub blinding_key: Vec<u8>,
    pub blinder_index: u32,
}

impl TxOutput {
    pub fn is_confidential(&self) -> bool {
        !self.blinding_key.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.asset.is_empty() {
            return Err(Error::Validation("output is missing asset".to_string()));
        }
        match hex::decode(&self.asset) {
            Ok(bytes) if bytes.len() == 32 => {}
            _ => {
                return Err(Error::Validation(
                    "invalid output asset length: must be exactly 32 bytes".to_string(),
                ));
            }
        }
        if self.is_confidential() {
            lwk_wollet::bitcoin::PublicKey::from_slice(&self.blinding_key)
                .map_err(|_| Error::Validation("invalid output blinding key".to_string()))?;
        }
        Ok(())
    }
}

/// Partial transaction operations, with PSETs as base64 and transactions as
/// hex strings.
pub trait PsetBackend: Send + Sync {
    fn create_pset(&self, inputs: &[TxInput], outputs: &[TxOutput]) -> Result<String>;

    fn update_pset(&self, pset: &str, inputs: &[TxInput], outputs: &[TxOutput]) -> Result<String>;

    /// Blinds the outputs carrying a blinding key. `owned_inputs` maps input
    /// indexes to the coins whose secrets are known.
    fn blind_pset_with_owned_inputs(
        &self,
        pset: &str,
        owned_inputs: &BTreeMap<usize, TxInput>,
        last_blinder: bool,
    ) -> Result<String>;

    /// Signs the inputs whose script is in `derivation_paths` (hex script ->
    /// path relative to the wallet root).
    fn sign_pset(
        &self,
        pset: &str,
        mnemonic: &str,
        derivation_paths: &HashMap<String, String>,
    ) -> Result<String>;

    /// Signs the `owned_inputs` of a raw transaction.
    fn sign_transaction(
        &self,
        tx_hex: &str,
        owned_inputs: &BTreeMap<usize, TxInput>,
        mnemonic: &str,
        derivation_paths: &HashMap<String, String>,
    ) -> Result<String>;

    /// Finalizes every signed input and returns the raw transaction hex.
    fn finalize_and_extract(&self, pset: &str) -> Result<String>;

    /// Outpoints spent by the PSET, in input order.
    fn pset_inputs(&self, pset: &str) -> Result<Vec<UtxoKey>>;

    /// Outpoints spent by the raw transaction, in input order.
    fn transaction_inputs(&self, tx_hex: &str) -> Result<Vec<UtxoKey>>;

    fn transaction_id(&self, tx_hex: &str) -> Result<String>;
}

// ── Helpers ─────────────────────────────────────────────────────────

fn parse_asset(asset: &str) -> Result<AssetId> {
    AssetId::from_str(asset).map_err(|e| Error::Pset(format!("invalid asset {asset}: {e}")))
}

fn parse_pset(pset: &str) -> Result<PartiallySignedTransaction> {
    PartiallySignedTransaction::from_str(pset).map_err(|e| Error::Pset(format!("invalid pset: {e}")))
}

pub(crate) fn parse_transaction(tx_hex: &str) -> Result<Transaction> {
    let bytes = hex::decode(tx_hex).map_err(|e| Error::Validation(format!("invalid tx hex: {e}")))?;
    deserialize(&bytes).map_err(|e| Error::Validation(format!("invalid transaction: {e}")))
}

fn add_pset_input(pset: &mut PartiallySignedTransaction, input: &TxInput) -> Result<()> {
    let previous_txid =
        Txid::from_str(&input.txid).map_err(|e| Error::Pset(format!("invalid txid: {e}")))?;
    let pset_input = lwk_wollet::elements::pset::Input {
        previous_txid,
        previous_output_index: input.vout,
        witness_utxo: Some(input.prevout()?),
        sequence: Some(Sequence::ENABLE_LOCKTIME_NO_RBF),
        ..Default::default()
    };
    pset.add_input(pset_input);
    Ok(())
}

fn add_pset_output(pset: &mut PartiallySignedTransaction, output: &TxOutput) -> Result<()> {
    output.validate()?;
    let blinding_key = if output.is_confidential() {
        Some(
            lwk_wollet::bitcoin::PublicKey::from_slice(&output.blinding_key)
                .map_err(|e| Error::Pset(format!("blinding key: {e}")))?,
        )
    } else {
        None
    };
    let pset_output = lwk_wollet::elements::pset::Output {
        amount: Some(output.amount),
        asset: Some(parse_asset(&output.asset)?),
        script_pubkey: Script::from(output.script.clone()),
        blinder_index: blinding_key.map(|_| output.blinder_index),
        blinding_key,
        ..Default::default()
    };
    pset.add_output(pset_output);
    Ok(())
}

// ── lwk backend ─────────────────────────────────────────────────────

/// [`PsetBackend`] signing with a software signer built from the mnemonic.
#[derive(Debug, Clone)]
pub struct LwkPsetBackend {
    network: Network,
}

impl LwkPsetBackend {
    pub fn new(network: Network) -> Self {
        Self { network }
    }

    fn signer(&self, mnemonic: &str) -> Result<SwSigner> {
        SwSigner::new(mnemonic, self.network.is_mainnet()).map_err(|e| Error::Signer(e.to_string()))
    }

    /// Fills the bip32 derivation of our inputs and signs them.
    fn sign_inputs(
        &self,
        pset: &mut PartiallySignedTransaction,
        mnemonic: &str,
        derivation_paths: &HashMap<String, String>,
    ) -> Result<()> {
        let signer = self.signer(mnemonic)?;
        let fingerprint = signer.fingerprint();
        let root = self.network.root_path();

        for (i, input) in pset.inputs_mut().iter_mut().enumerate() {
            let Some(prevout) = input.witness_utxo.as_ref() else {
                continue;
            };
            let script_hex = hex::encode(prevout.script_pubkey.as_bytes());
            let Some(relative) = derivation_paths.get(&script_hex) else {
                continue;
            };
            let path: DerivationPath = format!("{root}/{relative}")
                .parse()
                .map_err(|e| Error::Signer(format!("input {i} path: {e}")))?;
            let xpub = signer
                .derive_xpub(&path)
                .map_err(|e| Error::Signer(format!("{:?}", e)))?;
            let pubkey = lwk_wollet::bitcoin::PublicKey::new(xpub.public_key);
            input.bip32_derivation.insert(pubkey, (fingerprint, path));
        }

        signer
            .sign(pset)
            .map_err(|e| Error::Signer(format!("{:?}", e)))?;
        Ok(())
    }
}

/// Moves the P2WPKH partial signature of every signed input into its final
/// witness.
fn finalize_p2wpkh_inputs(pset: &mut PartiallySignedTransaction) -> Result<()> {
    for (i, input) in pset.inputs_mut().iter_mut().enumerate() {
        if input.final_script_witness.is_some() {
            continue;
        }
        let (pubkey, sig) = input
            .partial_sigs
            .iter()
            .next()
            .map(|(pk, sig)| (*pk, sig.clone()))
            .ok_or_else(|| Error::Finalize(format!("input {i} is not signed")))?;
        input.final_script_witness = Some(vec![sig, pubkey.to_bytes()]);
        input.partial_sigs.clear();
        input.bip32_derivation.clear();
    }
    Ok(())
}

impl PsetBackend for LwkPsetBackend {
    fn create_pset(&self, inputs: &[TxInput], outputs: &[TxOutput]) -> Result<String> {
        let mut pset = PartiallySignedTransaction::new_v2();
        for input in inputs {
            add_pset_input(&mut pset, input)?;
        }
        for output in outputs {
            add_pset_output(&mut pset, output)?;
        }
        Ok(pset.to_string())
    }

    fn update_pset(&self, pset: &str, inputs: &[TxInput], outputs: &[TxOutput]) -> Result<String> {
        let mut pset = parse_pset(pset)?;
        for input in inputs {
            add_pset_input(&mut pset, input)?;
        }
        for output in outputs {
            add_pset_output(&mut pset, output)?;
        }
        Ok(pset.to_string())
    }

    fn blind_pset_with_owned_inputs(
        &self,
        pset: &str,
        owned_inputs: &BTreeMap<usize, TxInput>,
        last_blinder: bool,
    ) -> Result<String> {
        let mut pset = parse_pset(pset)?;

        let mut inp_txout_sec = HashMap::new();
        for (idx, input) in owned_inputs {
            inp_txout_sec.insert(*idx, input.secrets()?);
        }

        let secp = secp256k1_zkp::Secp256k1::new();
        let mut rng = thread_rng();
        if last_blinder {
            pset.blind_last(&mut rng, &secp, &inp_txout_sec)
                .map_err(|e| Error::Blinding(format!("{e:?}")))?;
        } else {
            pset.blind_non_last(&mut rng, &secp, &inp_txout_sec)
                .map_err(|e| Error::Blinding(format!("{e:?}")))?;
        }
        Ok(pset.to_string())
    }

    fn sign_pset(
        &self,
        pset: &str,
        mnemonic: &str,
        derivation_paths: &HashMap<String, String>,
    ) -> Result<String> {
        let mut pset = parse_pset(pset)?;
        self.sign_inputs(&mut pset, mnemonic, derivation_paths)?;
        Ok(pset.to_string())
    }

    fn sign_transaction(
        &self,
        tx_hex: &str,
        owned_inputs: &BTreeMap<usize, TxInput>,
        mnemonic: &str,
        derivation_paths: &HashMap<String, String>,
    ) -> Result<String> {
        let tx = parse_transaction(tx_hex)?;
        let mut pset = PartiallySignedTransaction::from_tx(tx.clone());
        for (idx, input) in owned_inputs {
            let pset_input = pset
                .inputs_mut()
                .get_mut(*idx)
                .ok_or_else(|| Error::Pset(format!("input {idx} out of range")))?;
            pset_input.witness_utxo = Some(input.prevout()?);
        }
        self.sign_inputs(&mut pset, mnemonic, derivation_paths)?;

        let mut signed = tx;
        for (idx, input) in pset.inputs().iter().enumerate() {
            let Some((pubkey, sig)) = input.partial_sigs.iter().next() else {
                continue;
            };
            signed.input[idx].witness.script_witness = vec![sig.clone(), pubkey.to_bytes()];
        }
        Ok(hex::encode(serialize(&signed)))
    }

    fn finalize_and_extract(&self, pset: &str) -> Result<String> {
        let mut pset = parse_pset(pset)?;
        finalize_p2wpkh_inputs(&mut pset)?;
        let tx = pset
            .extract_tx()
            .map_err(|e| Error::Finalize(e.to_string()))?;
        Ok(hex::encode(serialize(&tx)))
    }

    fn pset_inputs(&self, pset: &str) -> Result<Vec<UtxoKey>> {
        let pset = parse_pset(pset)?;
        Ok(pset
            .inputs()
            .iter()
            .map(|i| UtxoKey::new(i.previous_txid.to_string(), i.previous_output_index))
            .collect())
    }

    fn transaction_inputs(&self, tx_hex: &str) -> Result<Vec<UtxoKey>> {
        let tx = parse_transaction(tx_hex)?;
        Ok(tx
            .input
            .iter()
            .map(|i| UtxoKey::new(i.previous_output.txid.to_string(), i.previous_output.vout))
            .collect())
    }

    fn transaction_id(&self, tx_hex: &str) -> Result<String> {
        Ok(parse_transaction(tx_hex)?.txid().to_string())
    }
}
