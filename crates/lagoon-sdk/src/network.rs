use lwk_wollet::ElementsNetwork;
use lwk_wollet::elements::AddressParams;
use serde::{Deserialize, Serialize};

/// Network variants for Liquid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[serde(alias = "mainnet")]
    Liquid,
    #[serde(rename = "testnet", alias = "liquidtestnet")]
    LiquidTestnet,
    #[serde(rename = "regtest", alias = "liquidregtest")]
    LiquidRegtest,
}

impl Network {
    pub fn into_lwk(self) -> ElementsNetwork {
        match self {
            Network::Liquid => ElementsNetwork::Liquid,
            Network::LiquidTestnet => ElementsNetwork::LiquidTestnet,
            Network::LiquidRegtest => ElementsNetwork::default_regtest(),
        }
    }

    pub fn is_mainnet(self) -> bool {
        matches!(self, Network::Liquid)
    }

    /// Hex id of the native asset, the one fees are paid in.
    pub fn policy_asset(self) -> String {
        self.into_lwk().policy_asset().to_string()
    }

    /// BIP44 coin type used in account derivation paths.
    pub fn coin_type(self) -> u32 {
        match self {
            Network::Liquid => 1776,
            Network::LiquidTestnet | Network::LiquidRegtest => 1,
        }
    }

    /// Root of every account derivation path, e.g. `m/84'/1776'`.
    pub fn root_path(self) -> String {
        format!("m/84'/{}'", self.coin_type())
    }

    pub fn default_electrum_url(self) -> &'static str {
        match self {
            Network::Liquid => "ssl://blockstream.info:995",
            Network::LiquidTestnet => "ssl://blockstream.info:465",
            Network::LiquidRegtest => "tcp://localhost:50001",
        }
    }

    pub fn address_params(self) -> &'static AddressParams {
        match self {
            Network::Liquid => &AddressParams::LIQUID,
            Network::LiquidTestnet => &AddressParams::LIQUID_TESTNET,
            Network::LiquidRegtest => &AddressParams::ELEMENTS,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Network::Liquid => "liquid",
            Network::LiquidTestnet => "testnet",
            Network::LiquidRegtest => "regtest",
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "liquid" => Ok(Network::Liquid),
            "testnet" | "liquid-testnet" | "liquidtestnet" => Ok(Network::LiquidTestnet),
            "regtest" | "liquid-regtest" | "liquidregtest" => Ok(Network::LiquidRegtest),
            _ => Err(format!("invalid network: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aliases() {
        assert_eq!("liquid".parse::<Network>().unwrap(), Network::Liquid);
        assert_eq!("mainnet".parse::<Network>().unwrap(), Network::Liquid);
        assert_eq!(
            "Liquid-Testnet".parse::<Network>().unwrap(),
            Network::LiquidTestnet
        );
        assert!("bitcoin".parse::<Network>().is_err());
    }

    #[test]
    fn root_path_uses_coin_type() {
        assert_eq!(Network::Liquid.root_path(), "m/84'/1776'");
        assert_eq!(Network::LiquidTestnet.root_path(), "m/84'/1'");
    }

    #[test]
    fn policy_asset_is_hex_id() {
        let asset = Network::Liquid.policy_asset();
        assert_eq!(asset.len(), 64);
        assert_eq!(
            asset,
            "6f0279e9ed041c3d710a9f57d0c02928416460c4b722ae3457a11eec381c526d"
        );
    }

    #[test]
    fn serde_names_match_display() {
        for network in [Network::Liquid, Network::LiquidTestnet, Network::LiquidRegtest] {
            let json = serde_json::to_string(&network).unwrap();
            assert_eq!(json, format!("\"{}\"", network));
        }
        let parsed: Network = serde_json::from_str("\"mainnet\"").unwrap();
        assert_eq!(parsed, Network::Liquid);
    }
}
