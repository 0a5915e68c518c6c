// src/db.rs
//
// Read-side query helpers. All queries are runtime-checked so the build
// never depends on a live database. Transactional writes live next to the
// logic that owns them (ledger.rs, billing.rs, api/*).

use sqlx::PgPool;

use crate::models::{MembershipItem, PaymentTransaction, Subscription, TokenType, Wallet};

pub async fn get_token_type(pool: &PgPool, id: i32) -> Result<Option<TokenType>, sqlx::Error> {
    sqlx::query_as::<_, TokenType>(
        "SELECT id, symbol, name, price, created_at FROM token_types WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn get_wallet(pool: &PgPool, id: i32) -> Result<Option<Wallet>, sqlx::Error> {
    sqlx::query_as::<_, Wallet>(
        "SELECT id, address, token_type_id, balance, created_at FROM wallets WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn get_wallet_by_address(
    pool: &PgPool,
    address: &str,
) -> Result<Option<Wallet>, sqlx::Error> {
    sqlx::query_as::<_, Wallet>(
        "SELECT id, address, token_type_id, balance, created_at FROM wallets WHERE address = $1",
    )
    .bind(address)
    .fetch_optional(pool)
    .await
}

/// The wallet currently owned by `owner_id` for the given token type, if any.
/// "Currently" means the ownership row with `ended_at IS NULL`.
pub async fn find_active_wallet(
    pool: &PgPool,
    owner_id: i32,
    token_type_id: i32,
) -> Result<Option<Wallet>, sqlx::Error> {
    sqlx::query_as::<_, Wallet>(
        r#"SELECT w.id, w.address, w.token_type_id, w.balance, w.created_at
           FROM wallets w
           JOIN wallet_ownerships o ON o.wallet_id = w.id AND o.ended_at IS NULL
           WHERE o.owner_id = $1 AND w.token_type_id = $2"#,
    )
    .bind(owner_id)
    .bind(token_type_id)
    .fetch_optional(pool)
    .await
}

pub async fn get_membership_item(
    pool: &PgPool,
    id: i32,
) -> Result<Option<MembershipItem>, sqlx::Error> {
    sqlx::query_as::<_, MembershipItem>(
        r#"SELECT id, creator_id, level, name, price, billing_period, billing_unit,
                  is_active, created_at
           FROM membership_items
           WHERE id = $1"#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

const TX_COLUMNS: &str = r#"id, order_id, payment_key, user_id, amount, token_amount,
    token_type_id, subscription_id, billing_key, is_recurring, status, method,
    approved_at, cancelled_at, failure_code, failure_message, raw_response, created_at"#;

pub async fn get_payment_transaction_by_order_id(
    pool: &PgPool,
    order_id: &str,
) -> Result<Option<PaymentTransaction>, sqlx::Error> {
    sqlx::query_as::<_, PaymentTransaction>(&format!(
        "SELECT {TX_COLUMNS} FROM payment_transactions WHERE order_id = $1"
    ))
    .bind(order_id)
    .fetch_optional(pool)
    .await
}

/// Secondary webhook lookup key, for senders that only echo the payment key.
pub async fn get_payment_transaction_by_payment_key(
    pool: &PgPool,
    payment_key: &str,
) -> Result<Option<PaymentTransaction>, sqlx::Error> {
    sqlx::query_as::<_, PaymentTransaction>(&format!(
        "SELECT {TX_COLUMNS} FROM payment_transactions WHERE payment_key = $1"
    ))
    .bind(payment_key)
    .fetch_optional(pool)
    .await
}

pub async fn list_payment_transactions(
    pool: &PgPool,
    user_id: i32,
    offset: i64,
    limit: i64,
    status: Option<&str>,
) -> Result<Vec<PaymentTransaction>, sqlx::Error> {
    match status {
        Some(status) => {
            sqlx::query_as::<_, PaymentTransaction>(&format!(
                r#"SELECT {TX_COLUMNS} FROM payment_transactions
                   WHERE user_id = $1 AND status = $2
                   ORDER BY created_at DESC
                   LIMIT $3 OFFSET $4"#
            ))
            .bind(user_id)
            .bind(status)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, PaymentTransaction>(&format!(
                r#"SELECT {TX_COLUMNS} FROM payment_transactions
                   WHERE user_id = $1
                   ORDER BY created_at DESC
                   LIMIT $2 OFFSET $3"#
            ))
            .bind(user_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
        }
    }
}

const SUB_COLUMNS: &str = r#"id, subscriber_id, membership_item_id, amount, billing_key,
    status, auto_renew, next_billing_date, last_payment_date, payment_failure_count,
    started_at, ended_at"#;

pub async fn get_subscription(
    pool: &PgPool,
    id: i32,
) -> Result<Option<Subscription>, sqlx::Error> {
    sqlx::query_as::<_, Subscription>(&format!(
        "SELECT {SUB_COLUMNS} FROM subscriptions WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn find_ongoing_subscription(
    pool: &PgPool,
    subscriber_id: i32,
    membership_item_id: i32,
) -> Result<Option<Subscription>, sqlx::Error> {
    sqlx::query_as::<_, Subscription>(&format!(
        r#"SELECT {SUB_COLUMNS} FROM subscriptions
           WHERE subscriber_id = $1 AND membership_item_id = $2
             AND status = 'ONGOING' AND ended_at IS NULL"#
    ))
    .bind(subscriber_id)
    .bind(membership_item_id)
    .fetch_optional(pool)
    .await
}

/// Subscriptions the billing batch must charge at `now`.
pub async fn list_due_subscriptions(
    pool: &PgPool,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<Vec<Subscription>, sqlx::Error> {
    sqlx::query_as::<_, Subscription>(&format!(
        r#"SELECT {SUB_COLUMNS} FROM subscriptions
           WHERE status = 'ONGOING'
             AND auto_renew = TRUE
             AND billing_key IS NOT NULL
             AND next_billing_date <= $1
           ORDER BY next_billing_date ASC"#
    ))
    .bind(now)
    .fetch_all(pool)
    .await
}

/// Deferred-cancelled subscriptions whose paid period has elapsed.
pub async fn list_expirable_subscriptions(
    pool: &PgPool,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<Vec<Subscription>, sqlx::Error> {
    sqlx::query_as::<_, Subscription>(&format!(
        r#"SELECT {SUB_COLUMNS} FROM subscriptions
           WHERE status = 'ONGOING'
             AND auto_renew = FALSE
             AND next_billing_date <= $1"#
    ))
    .bind(now)
    .fetch_all(pool)
    .await
}
