use diesel::prelude::*;

use crate::schema::{account_scripts, accounts, wallet};

/// The single wallet row, always stored with `id = 1`.
#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = wallet)]
pub struct WalletRow {
    pub id: i32,
    pub encrypted_mnemonic: Vec<u8>,
    pub password_hash: Vec<u8>,
    pub birthday_block_height: i64,
    pub root_path: String,
    pub network: String,
    pub next_account_index: i64,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = accounts)]
pub struct AccountRow {
    pub name: String,
    pub account_index: i64,
    pub xpub: String,
    pub derivation_path: String,
    pub next_external_index: i64,
    pub next_internal_index: i64,
    pub birthday_block: i64,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = account_scripts)]
pub struct AccountScriptRow {
    pub account_name: String,
    pub script: String,
    pub derivation_path: String,
}
