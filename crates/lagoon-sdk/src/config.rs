use std::time::Duration;

use crate::fees::MIN_MILLISATS_PER_BYTE;
use crate::network::Network;

/// Knobs shared by the wallet services.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub network: Network,
    /// How long selected coins stay locked before being released.
    pub utxo_expiry: Duration,
    /// Retry interval of a failed unlock.
    pub unlock_retry: Duration,
    /// Delay between the first queued chain transaction report and the
    /// flush of the queue.
    pub tx_queue_delay: Duration,
    /// Fee rate used when a caller passes 0.
    pub min_millisats_per_byte: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            network: Network::Liquid,
            utxo_expiry: Duration::from_secs(360),
            unlock_retry: Duration::from_secs(5),
            tx_queue_delay: Duration::from_secs(1),
            min_millisats_per_byte: MIN_MILLISATS_PER_BYTE,
        }
    }
}

impl ServiceConfig {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            ..Default::default()
        }
    }

    pub fn with_utxo_expiry(mut self, expiry: Duration) -> Self {
        self.utxo_expiry = expiry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ServiceConfig::new(Network::LiquidTestnet);
        assert_eq!(cfg.network, Network::LiquidTestnet);
        assert_eq!(cfg.utxo_expiry, Duration::from_secs(360));
        assert_eq!(cfg.unlock_retry, Duration::from_secs(5));
        assert_eq!(cfg.tx_queue_delay, Duration::from_secs(1));
        assert_eq!(cfg.min_millisats_per_byte, 100);
    }
}
