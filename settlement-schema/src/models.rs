// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use diesel::prelude::*;
use rust_decimal::Decimal;

use crate::schema::{funding_requests, user_ledgers};

#[derive(Queryable, Selectable, Debug, Clone, PartialEq)]
#[diesel(table_name = funding_requests, check_for_backend(diesel::pg::Pg))]
pub struct FundingRequestRow {
    pub id: i64,
    pub user_id: i64,
    pub currency: String,
    pub expected_usd: Decimal,
    pub wallet_address: String,
    pub observed_chain_hash: Option<String>,
    pub observed_confirmations: i64,
    pub observed_block_number: Option<i64>,
    pub required_confirmations: i64,
    pub actual_usd: Option<Decimal>,
    pub status: String,
    pub failure_reason: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = funding_requests)]
pub struct NewFundingRequestRow {
    pub user_id: i64,
    pub currency: String,
    pub expected_usd: Decimal,
    pub wallet_address: String,
    pub required_confirmations: i64,
    pub status: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Queryable, Selectable, Debug, Clone, PartialEq)]
#[diesel(table_name = user_ledgers, check_for_backend(diesel::pg::Pg))]
pub struct UserLedgerRow {
    pub user_id: i64,
    pub total_invested: Decimal,
    pub current_balance: Decimal,
    pub daily_yield_rate: Decimal,
    pub last_yield_update_ms: Option<i64>,
}
