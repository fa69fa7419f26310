use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // ── Coin selection ───────────────────────────────────────────────────
    #[error("blinded utxos must be revealed before coin selection")]
    BlindedUtxos,

    #[error("target amount not reached")]
    TargetAmountNotReached,

    // ── Locking discipline ───────────────────────────────────────────────
    #[error(
        "cannot use unlocked utxos. The utxos used within 'external' transactions must be \
         coming from a coin selection so that they can be locked to prevent double spending them"
    )]
    ForbiddenUnlockedInputs,

    #[error("cannot broadcast transaction containing unlocked utxos")]
    UnlockedUtxosInBroadcast,

    #[error("selected utxos were locked by a concurrent selection")]
    LockConflict,

    // ── Wallet ───────────────────────────────────────────────────────────
    #[error("missing mnemonic")]
    MissingMnemonic,

    #[error("missing password")]
    MissingPassword,

    #[error("wallet is locked")]
    WalletLocked,

    #[error("wallet must be locked")]
    WalletUnlocked,

    #[error("wallet is already initialized")]
    WalletAlreadyInitialized,

    #[error("wallet is not initialized")]
    WalletNotInitialized,

    #[error("wrong password")]
    InvalidPassword,

    #[error("reached max number of accounts")]
    MaxAccountNumberReached,

    #[error("account not found in wallet")]
    AccountNotFound,

    #[error("account {0} already exists")]
    AccountAlreadyExists(String),

    #[error("account {0} must have zero balance to be deleted")]
    NonZeroBalance(String),

    // ── Validation ───────────────────────────────────────────────────────
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("transaction {0} not found")]
    TransactionNotFound(String),

    // ── Collaborators ────────────────────────────────────────────────────
    #[error("store error: {0}")]
    Store(String),

    #[error("mnemonic cipher error: {0}")]
    Cipher(String),

    #[error("signer error: {0}")]
    Signer(String),

    #[error("key derivation error: {0}")]
    Derivation(String),

    #[error("PSET construction error: {0}")]
    Pset(String),

    #[error("blinding error: {0}")]
    Blinding(String),

    #[error("finalize error: {0}")]
    Finalize(String),

    #[error("electrum error: {0}")]
    Electrum(String),

    #[error("broadcast error: {0}")]
    Broadcast(String),

    #[error("chain query error: {0}")]
    Query(String),

    // ── Runtime ──────────────────────────────────────────────────────────
    #[error("no tokio runtime available: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, Error>;
