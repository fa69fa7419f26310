use diesel::prelude::*;

use crate::schema::utxos;

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = utxos)]
pub struct UtxoRow {
    pub txid: String,
    pub vout: i32,
    pub account_name: String,
    pub value: i64,
    pub asset: String,
    pub value_commitment: Vec<u8>,
    pub asset_commitment: Vec<u8>,
    pub value_blinder: Vec<u8>,
    pub asset_blinder: Vec<u8>,
    pub script: Vec<u8>,
    pub nonce: Vec<u8>,
    pub range_proof: Vec<u8>,
    pub surjection_proof: Vec<u8>,
    pub lock_timestamp: i64,
    pub lock_expiry_timestamp: i64,
    pub spent_txid: Option<String>,
    pub spent_block_hash: Option<String>,
    pub spent_block_height: Option<i64>,
    pub spent_block_time: Option<i64>,
    pub confirmed_txid: Option<String>,
    pub confirmed_block_hash: Option<String>,
    pub confirmed_block_height: Option<i64>,
    pub confirmed_block_time: Option<i64>,
}

/// The mutable part of a coin: lock, spend and confirmation.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = utxos, treat_none_as_null = true)]
pub struct UtxoStateChanges {
    pub lock_timestamp: i64,
    pub lock_expiry_timestamp: i64,
    pub spent_txid: Option<String>,
    pub spent_block_hash: Option<String>,
    pub spent_block_height: Option<i64>,
    pub spent_block_time: Option<i64>,
    pub confirmed_txid: Option<String>,
    pub confirmed_block_hash: Option<String>,
    pub confirmed_block_height: Option<i64>,
    pub confirmed_block_time: Option<i64>,
}
