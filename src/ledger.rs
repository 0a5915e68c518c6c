// src/ledger.rs
//
// Wallets and transfers. Every mutation here is one database transaction:
// either both balances and the transfer row persist, or none do.

use chrono::{DateTime, Utc};
use rand::RngCore;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use sqlx::{PgConnection, PgPool, Row};

use crate::error::{AppError, is_unique_violation};
use crate::models::{Transfer, Wallet};

/// Deterministic digest over the transfer inputs. Audit and dedupe only,
/// never a security boundary.
pub fn transfer_hash(
    from_address: &str,
    to_address: &str,
    amount: Decimal,
    reason: &str,
    at: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(from_address.as_bytes());
    hasher.update(b"|");
    hasher.update(to_address.as_bytes());
    hasher.update(b"|");
    hasher.update(amount.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(reason.as_bytes());
    hasher.update(b"|");
    hasher.update(at.timestamp_millis().to_string().as_bytes());
    hex::encode(hasher.finalize())
}

pub fn new_wallet_address() -> String {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("0x{}", hex::encode(bytes))
}

/// Creates a zero-balance wallet plus its open ownership row.
/// `Conflict` if the owner already holds an active wallet of this token type.
pub async fn create_wallet(
    pool: &PgPool,
    token_type_id: i32,
    owner_id: i32,
) -> Result<Wallet, AppError> {
    if crate::db::get_token_type(pool, token_type_id).await?.is_none() {
        return Err(AppError::NotFound("token type"));
    }

    let mut tx = pool.begin().await?;
    lock_owner_wallet_slot(&mut tx, owner_id, token_type_id).await?;
    if active_wallet_in_tx(&mut tx, owner_id, token_type_id)
        .await?
        .is_some()
    {
        return Err(AppError::Conflict(format!(
            "owner {owner_id} already holds a wallet for token type {token_type_id}"
        )));
    }
    let wallet = insert_wallet(&mut *tx, token_type_id, owner_id).await?;
    tx.commit().await?;
    Ok(wallet)
}

/// Transaction-scoped advisory lock serializing wallet creation per
/// (owner, token type). Held until the surrounding transaction ends, so a
/// concurrent creator blocks here and then sees the committed wallet.
async fn lock_owner_wallet_slot(
    conn: &mut PgConnection,
    owner_id: i32,
    token_type_id: i32,
) -> Result<(), AppError> {
    sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
        .bind(owner_id)
        .bind(token_type_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn active_wallet_in_tx(
    conn: &mut PgConnection,
    owner_id: i32,
    token_type_id: i32,
) -> Result<Option<Wallet>, AppError> {
    Ok(sqlx::query_as::<_, Wallet>(
        r#"SELECT w.id, w.address, w.token_type_id, w.balance, w.created_at
           FROM wallets w
           JOIN wallet_ownerships o ON o.wallet_id = w.id AND o.ended_at IS NULL
           WHERE o.owner_id = $1 AND w.token_type_id = $2"#,
    )
    .bind(owner_id)
    .bind(token_type_id)
    .fetch_optional(&mut *conn)
    .await?)
}

async fn insert_wallet(
    conn: &mut PgConnection,
    token_type_id: i32,
    owner_id: i32,
) -> Result<Wallet, AppError> {
    let wallet = sqlx::query_as::<_, Wallet>(
        r#"INSERT INTO wallets (address, token_type_id, balance)
           VALUES ($1, $2, 0)
           RETURNING id, address, token_type_id, balance, created_at"#,
    )
    .bind(new_wallet_address())
    .bind(token_type_id)
    .fetch_one(&mut *conn)
    .await?;

    // The partial unique index is the schema backstop if a caller ever gets
    // here without holding the advisory lock.
    sqlx::query(
        "INSERT INTO wallet_ownerships (wallet_id, owner_id, token_type_id) VALUES ($1, $2, $3)",
    )
    .bind(wallet.id)
    .bind(owner_id)
    .bind(token_type_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e, "wallet_ownerships_owner_slot_idx") {
            AppError::Conflict(format!(
                "owner {owner_id} already holds a wallet for token type {token_type_id}"
            ))
        } else {
            AppError::Db(e)
        }
    })?;

    Ok(wallet)
}

/// The owner's active wallet for a token type, created on first need.
/// Must run inside the caller's transaction so wallet creation commits or
/// rolls back together with whatever triggered it. Takes the advisory lock
/// first, so two callers crediting the same new owner cannot both insert.
pub async fn ensure_wallet(
    conn: &mut PgConnection,
    owner_id: i32,
    token_type_id: i32,
) -> Result<Wallet, AppError> {
    lock_owner_wallet_slot(conn, owner_id, token_type_id).await?;
    match active_wallet_in_tx(conn, owner_id, token_type_id).await? {
        Some(w) => Ok(w),
        None => insert_wallet(conn, token_type_id, owner_id).await,
    }
}

/// Moves `amount` between two wallets of the same token type and records one
/// immutable transfer row. Standalone entry point; composable variant below.
pub async fn transfer_token(
    pool: &PgPool,
    from_wallet_id: i32,
    to_wallet_id: i32,
    amount: Decimal,
    reason_code: &str,
    reference_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Transfer, AppError> {
    let mut tx = pool.begin().await?;
    let transfer = transfer_in_tx(
        &mut *tx,
        from_wallet_id,
        to_wallet_id,
        amount,
        reason_code,
        reference_id,
        now,
    )
    .await?;
    tx.commit().await?;
    Ok(transfer)
}

/// Transfer body, running inside the caller's transaction.
///
/// Both wallet rows are locked FOR UPDATE in ascending id order before the
/// balance read, so two concurrent transfers from the same wallet serialize
/// and the second sees the first one's debit. Ascending order keeps lock
/// acquisition consistent across callers and rules out deadlock.
pub async fn transfer_in_tx(
    conn: &mut PgConnection,
    from_wallet_id: i32,
    to_wallet_id: i32,
    amount: Decimal,
    reason_code: &str,
    reference_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Transfer, AppError> {
    if amount <= Decimal::ZERO {
        return Err(AppError::InvalidArgument(format!(
            "transfer amount must be positive, got {amount}"
        )));
    }
    if from_wallet_id == to_wallet_id {
        return Err(AppError::InvalidArgument(
            "cannot transfer to the same wallet".into(),
        ));
    }

    let reason_row = sqlx::query("SELECT id FROM transfer_reasons WHERE code = $1")
        .bind(reason_code)
        .fetch_optional(&mut *conn)
        .await?;
    let reason_id: i32 = match reason_row {
        Some(r) => r.get("id"),
        None => return Err(AppError::NotFound("transfer reason")),
    };

    let mut locked = Vec::with_capacity(2);
    let mut ids = [from_wallet_id, to_wallet_id];
    ids.sort_unstable();
    for id in ids {
        let wallet = sqlx::query_as::<_, Wallet>(
            r#"SELECT id, address, token_type_id, balance, created_at
               FROM wallets WHERE id = $1 FOR UPDATE"#,
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        match wallet {
            Some(w) => locked.push(w),
            None => return Err(AppError::NotFound("wallet")),
        }
    }

    let (from, to) = if locked[0].id == from_wallet_id {
        (&locked[0], &locked[1])
    } else {
        (&locked[1], &locked[0])
    };

    if from.token_type_id != to.token_type_id {
        return Err(AppError::InvalidArgument(
            "wallets hold different token types".into(),
        ));
    }
    if from.balance < amount {
        return Err(AppError::InsufficientFunds);
    }

    let from_after = from.balance - amount;
    let to_after = to.balance + amount;

    sqlx::query("UPDATE wallets SET balance = $1 WHERE id = $2")
        .bind(from_after)
        .bind(from.id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("UPDATE wallets SET balance = $1 WHERE id = $2")
        .bind(to_after)
        .bind(to.id)
        .execute(&mut *conn)
        .await?;

    let tx_hash = transfer_hash(&from.address, &to.address, amount, reason_code, now);

    let transfer = sqlx::query_as::<_, Transfer>(
        r#"INSERT INTO transfers
               (tx_hash, from_wallet_id, to_wallet_id, token_type_id, amount,
                from_balance_before, from_balance_after,
                to_balance_before, to_balance_after,
                reason_id, reference_id, status, created_at)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'CONFIRMED', $12)
           RETURNING id, tx_hash, from_wallet_id, to_wallet_id, token_type_id, amount,
                     from_balance_before, from_balance_after,
                     to_balance_before, to_balance_after,
                     reason_id, reference_id, status, created_at"#,
    )
    .bind(&tx_hash)
    .bind(from.id)
    .bind(to.id)
    .bind(from.token_type_id)
    .bind(amount)
    .bind(from.balance)
    .bind(from_after)
    .bind(to.balance)
    .bind(to_after)
    .bind(reason_id)
    .bind(reference_id)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    Ok(transfer)
}
