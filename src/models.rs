// src/models.rs

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::FromRow;
use utoipa::ToSchema;

#[derive(Debug, Serialize, FromRow)]
pub struct TokenType {
    pub id: i32,
    pub symbol: String,
    pub name: String,
    pub price: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, FromRow)]
pub struct Wallet {
    pub id: i32,
    pub address: String,
    pub token_type_id: i32,
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Append-only ledger entry. Balances are captured before and after so a
/// row can be audited without replaying history.
#[derive(Debug, Serialize, FromRow)]
pub struct Transfer {
    pub id: i32,
    pub tx_hash: String,
    pub from_wallet_id: i32,
    pub to_wallet_id: i32,
    pub token_type_id: i32,
    pub amount: Decimal,
    pub from_balance_before: Decimal,
    pub from_balance_after: Decimal,
    pub to_balance_before: Decimal,
    pub to_balance_after: Decimal,
    pub reason_id: i32,
    pub reference_id: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, FromRow, ToSchema)]
pub struct PaymentTransaction {
    pub id: i32,
    pub order_id: String,
    pub payment_key: Option<String>,
    pub user_id: i32,
    pub amount: i64,
    #[schema(value_type = String)]
    pub token_amount: Decimal,
    pub token_type_id: Option<i32>,
    pub subscription_id: Option<i32>,
    pub billing_key: Option<String>,
    pub is_recurring: bool,
    pub status: String, // PENDING | APPROVED | FAILED | CANCELLED
    pub method: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub raw_response: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// External collaborator entity. Read-only here apart from existence and
/// pricing lookups.
#[derive(Debug, Serialize, FromRow)]
pub struct MembershipItem {
    pub id: i32,
    pub creator_id: i32,
    pub level: i32,
    pub name: String,
    pub price: i64,
    pub billing_period: i32,
    pub billing_unit: String, // DAY | MONTH | YEAR
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, FromRow, ToSchema)]
pub struct Subscription {
    pub id: i32,
    pub subscriber_id: i32,
    pub membership_item_id: i32,
    pub amount: i64,
    pub billing_key: Option<String>,
    pub status: String, // ONGOING | CANCELLED | EXPIRED
    pub auto_renew: bool,
    pub next_billing_date: Option<DateTime<Utc>>,
    pub last_payment_date: Option<DateTime<Utc>>,
    pub payment_failure_count: i32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}
