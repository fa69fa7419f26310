//! HD key derivation for wallet accounts.

use lwk_common::Signer;
use lwk_signer::SwSigner;
use lwk_wollet::bitcoin::bip32::{ChildNumber, DerivationPath};
use lwk_wollet::elements::Address;
use lwk_wollet::elements::secp256k1_zkp;

use crate::error::{Error, Result};
use crate::network::Network;

/// A derived receiving or change address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedAddress {
    pub address: String,
    pub script: Vec<u8>,
    /// SLIP77 private blinding key of the script.
    pub blinding_key: Vec<u8>,
    pub blinding_pubkey: Vec<u8>,
}

pub trait KeyDeriver: Send + Sync {
    /// Extended public key of the hardened account `account_index`.
    fn account_xpub(&self, mnemonic: &str, account_index: u32) -> Result<String>;

    /// Address at `{account}'/{chain}/{index}` under the wallet root.
    fn derive_address(
        &self,
        mnemonic: &str,
        account_index: u32,
        chain: u32,
        index: u32,
    ) -> Result<DerivedAddress>;
}

/// BIP84 P2WPKH accounts with SLIP77 blinding keys.
#[derive(Debug, Clone)]
pub struct LwkKeyDeriver {
    network: Network,
}

impl LwkKeyDeriver {
    pub fn new(network: Network) -> Self {
        Self { network }
    }

    fn signer(&self, mnemonic: &str) -> Result<SwSigner> {
        SwSigner::new(mnemonic, self.network.is_mainnet())
            .map_err(|e| Error::Derivation(e.to_string()))
    }

    fn account_path(&self, account_index: u32) -> Result<DerivationPath> {
        format!("{}/{}'", self.network.root_path(), account_index)
            .parse()
            .map_err(|e| Error::Derivation(format!("{e}")))
    }
}

impl KeyDeriver for LwkKeyDeriver {
    fn account_xpub(&self, mnemonic: &str, account_index: u32) -> Result<String> {
        let signer = self.signer(mnemonic)?;
        let xpub = signer
            .derive_xpub(&self.account_path(account_index)?)
            .map_err(|e| Error::Derivation(format!("{:?}", e)))?;
        Ok(xpub.to_string())
    }

    fn derive_address(
        &self,
        mnemonic: &str,
        account_index: u32,
        chain: u32,
        index: u32,
    ) -> Result<DerivedAddress> {
        let signer = self.signer(mnemonic)?;
        let account_xpub = signer
            .derive_xpub(&self.account_path(account_index)?)
            .map_err(|e| Error::Derivation(format!("{:?}", e)))?;

        let children = [
            ChildNumber::from_normal_idx(chain).map_err(|e| Error::Derivation(e.to_string()))?,
            ChildNumber::from_normal_idx(index).map_err(|e| Error::Derivation(e.to_string()))?,
        ];
        let secp = lwk_wollet::bitcoin::secp256k1::Secp256k1::verification_only();
        let child = account_xpub
            .derive_pub(&secp, &children)
            .map_err(|e| Error::Derivation(e.to_string()))?;
        let pubkey = lwk_wollet::bitcoin::PublicKey::new(child.public_key);

        // The blinding key depends on the script only, so derive it from an
        // unconfidential address first.
        let unconfidential = Address::p2wpkh(&pubkey, None, self.network.address_params());
        let script = unconfidential.script_pubkey();

        let master_blinding_key = signer
            .slip77_master_blinding_key()
            .map_err(|e| Error::Derivation(e.to_string()))?;
        let blinding_sk = master_blinding_key.blinding_private_key(&script);
        let zkp = secp256k1_zkp::Secp256k1::new();
        let blinding_pk = secp256k1_zkp::PublicKey::from_secret_key(&zkp, &blinding_sk);

        let address = Address::p2wpkh(&pubkey, Some(blinding_pk), self.network.address_params());

        Ok(DerivedAddress {
            address: address.to_string(),
            script: script.to_bytes(),
            blinding_key: blinding_sk.secret_bytes().to_vec(),
            blinding_pubkey: blinding_pk.serialize().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn derives_confidential_p2wpkh() {
        let deriver = LwkKeyDeriver::new(Network::LiquidTestnet);
        let a = deriver.derive_address(MNEMONIC, 0, 0, 0).unwrap();
        assert_eq!(a.script.len(), 22);
        assert_eq!(&a.script[..2], &[0x00, 0x14]);
        assert_eq!(a.blinding_key.len(), 32);
        assert_eq!(a.blinding_pubkey.len(), 33);

        let parsed: Address = a.address.parse().unwrap();
        assert!(parsed.is_blinded());
        assert_eq!(parsed.script_pubkey().to_bytes(), a.script);
    }

    #[test]
    fn derivation_is_deterministic_and_distinct() {
        let deriver = LwkKeyDeriver::new(Network::LiquidTestnet);
        let a = deriver.derive_address(MNEMONIC, 0, 0, 0).unwrap();
        let b = deriver.derive_address(MNEMONIC, 0, 0, 0).unwrap();
        let change = deriver.derive_address(MNEMONIC, 0, 1, 0).unwrap();
        let other_account = deriver.derive_address(MNEMONIC, 1, 0, 0).unwrap();
        assert_eq!(a, b);
        assert_ne!(a.script, change.script);
        assert_ne!(a.script, other_account.script);
        assert_ne!(
            deriver.account_xpub(MNEMONIC, 0).unwrap(),
            deriver.account_xpub(MNEMONIC, 1).unwrap()
        );
    }
}
