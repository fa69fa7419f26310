use diesel::prelude::*;

use crate::schema::{transaction_accounts, transactions};

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = transactions, primary_key(txid))]
pub struct TransactionRow {
    pub txid: String,
    pub tx_hex: String,
    pub block_hash: String,
    pub block_height: i64,
    pub block_time: i64,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = transaction_accounts)]
pub struct TransactionAccountRow {
    pub txid: String,
    pub account_name: String,
}
