// src/api/payments.rs
//
// Payment Transaction Tracker: one-off token purchases. Flow is
// prepare (PENDING row) -> gateway confirm -> APPROVED + ledger credit
// from the system wallet, all guarded so webhook delivery can race a live
// confirmation without double-applying.

use actix_web::{HttpResponse, get, post, web};
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use utoipa::ToSchema;

use crate::api::toss_client::{ChargeResult, PaymentGateway};
use crate::error::AppError;
use crate::ledger;
use crate::models::PaymentTransaction;
use crate::{AppState, db};

/// Fixed KRW -> token table. An amount outside the table is rejected,
/// never defaulted to zero tokens.
pub fn token_amount_for_krw(amount: i64) -> Option<i64> {
    match amount {
        1_100 => Some(10),
        3_300 => Some(30),
        5_500 => Some(50),
        11_000 => Some(100),
        33_000 => Some(300),
        55_000 => Some(500),
        110_000 => Some(1_000),
        550_000 => Some(5_000),
        _ => None,
    }
}

pub fn new_order_id(user_id: i32, now: DateTime<Utc>) -> String {
    let random6: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("order_{}_{}_{}", user_id, now.timestamp_millis(), random6)
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PrepareRequest {
    pub user_id: i32,
    /// Purchase amount in KRW; must be one of the fixed table entries.
    pub amount: i64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ConfirmRequest {
    pub payment_key: String,
    pub order_id: String,
    pub amount: i64,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub user_id: i32,
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub status: Option<String>,
}

pub async fn prepare_one_off_purchase(
    pool: &PgPool,
    system_wallet_address: &str,
    user_id: i32,
    amount: i64,
    now: DateTime<Utc>,
) -> Result<PaymentTransaction, AppError> {
    let token_amount = token_amount_for_krw(amount).ok_or_else(|| {
        AppError::InvalidArgument(format!("amount {amount} is not a purchasable package"))
    })?;

    let system_wallet = db::get_wallet_by_address(pool, system_wallet_address)
        .await?
        .ok_or(AppError::NotFound("system wallet"))?;

    let order_id = new_order_id(user_id, now);
    let tx = sqlx::query_as::<_, PaymentTransaction>(
        r#"INSERT INTO payment_transactions
               (order_id, user_id, amount, token_amount, token_type_id, is_recurring, status)
           VALUES ($1, $2, $3, $4, $5, FALSE, 'PENDING')
           RETURNING id, order_id, payment_key, user_id, amount, token_amount,
                     token_type_id, subscription_id, billing_key, is_recurring, status,
                     method, approved_at, cancelled_at, failure_code, failure_message,
                     raw_response, created_at"#,
    )
    .bind(&order_id)
    .bind(user_id)
    .bind(amount)
    .bind(Decimal::from(token_amount))
    .bind(system_wallet.token_type_id)
    .fetch_one(pool)
    .await?;

    Ok(tx)
}

pub(crate) enum ApproveOutcome {
    /// This call performed the PENDING -> APPROVED transition and the credit.
    Applied(PaymentTransaction),
    /// A concurrent writer (webhook or earlier confirm) already approved it.
    AlreadyApproved(PaymentTransaction),
    /// Transaction is FAILED or CANCELLED; the transition does not apply.
    WrongState(String),
}

/// Status-guarded approval: flips the transaction to APPROVED only from
/// PENDING, and credits the buyer's wallet in the same database transaction
/// for non-recurring purchases. Safe to call from both the synchronous
/// confirm path and the webhook path.
pub(crate) async fn approve_transaction(
    pool: &PgPool,
    system_wallet_address: &str,
    order_id: &str,
    payment_key: Option<&str>,
    method: Option<&str>,
    approved_at: Option<DateTime<Utc>>,
    raw_response: Option<&serde_json::Value>,
    now: DateTime<Utc>,
) -> Result<ApproveOutcome, AppError> {
    let mut tx = pool.begin().await?;

    let updated = sqlx::query_as::<_, PaymentTransaction>(
        r#"UPDATE payment_transactions
           SET status = 'APPROVED',
               payment_key = COALESCE($2, payment_key),
               method = COALESCE($3, method),
               approved_at = COALESCE($4, NOW()),
               raw_response = COALESCE($5, raw_response)
           WHERE order_id = $1 AND status = 'PENDING'
           RETURNING id, order_id, payment_key, user_id, amount, token_amount,
                     token_type_id, subscription_id, billing_key, is_recurring, status,
                     method, approved_at, cancelled_at, failure_code, failure_message,
                     raw_response, created_at"#,
    )
    .bind(order_id)
    .bind(payment_key)
    .bind(method)
    .bind(approved_at)
    .bind(raw_response)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(approved) = updated else {
        // Lost the race (or replay): the current status decides the outcome.
        tx.rollback().await?;
        let current = db::get_payment_transaction_by_order_id(pool, order_id)
            .await?
            .ok_or(AppError::NotFound("payment transaction"))?;
        return Ok(if current.status == "APPROVED" {
            ApproveOutcome::AlreadyApproved(current)
        } else {
            ApproveOutcome::WrongState(current.status)
        });
    };

    // Subscriptions grant access, not tokens; only one-off purchases credit.
    if !approved.is_recurring && approved.token_amount > Decimal::ZERO {
        let system_wallet = sqlx::query_as::<_, crate::models::Wallet>(
            "SELECT id, address, token_type_id, balance, created_at FROM wallets WHERE address = $1",
        )
        .bind(system_wallet_address)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NotFound("system wallet"))?;

        let buyer_wallet =
            ledger::ensure_wallet(&mut *tx, approved.user_id, system_wallet.token_type_id).await?;

        ledger::transfer_in_tx(
            &mut *tx,
            system_wallet.id,
            buyer_wallet.id,
            approved.token_amount,
            "charge",
            Some(order_id),
            now,
        )
        .await?;
    }

    tx.commit().await?;
    Ok(ApproveOutcome::Applied(approved))
}

/// Marks the transaction FAILED with the gateway's error, but only while it
/// is still PENDING.
pub(crate) async fn fail_transaction(
    pool: &PgPool,
    order_id: &str,
    failure_code: &str,
    failure_message: &str,
) -> Result<(), AppError> {
    sqlx::query(
        r#"UPDATE payment_transactions
           SET status = 'FAILED', failure_code = $2, failure_message = $3
           WHERE order_id = $1 AND status = 'PENDING'"#,
    )
    .bind(order_id)
    .bind(failure_code)
    .bind(failure_message)
    .execute(pool)
    .await?;
    Ok(())
}

fn success_payload(tx: &PaymentTransaction) -> serde_json::Value {
    json!({
        "order_id": tx.order_id,
        "payment_key": tx.payment_key,
        "amount": tx.amount,
        "token_amount": tx.token_amount,
        "status": tx.status,
        "method": tx.method,
        "approved_at": tx.approved_at,
    })
}

/// Idempotent confirm: an already-APPROVED order returns the stored success
/// payload without another gateway call or ledger credit. An amount mismatch
/// leaves the row PENDING so a corrected retry is possible.
pub async fn confirm_one_off_purchase(
    pool: &PgPool,
    gateway: &dyn PaymentGateway,
    system_wallet_address: &str,
    payment_key: &str,
    order_id: &str,
    amount: i64,
    now: DateTime<Utc>,
) -> Result<serde_json::Value, AppError> {
    let stored = db::get_payment_transaction_by_order_id(pool, order_id)
        .await?
        .ok_or(AppError::NotFound("payment transaction"))?;

    if stored.status == "APPROVED" {
        return Ok(success_payload(&stored));
    }
    if stored.status != "PENDING" {
        return Err(AppError::InvalidState(format!(
            "cannot confirm a {} transaction",
            stored.status
        )));
    }
    if stored.amount != amount {
        return Err(AppError::InvalidArgument(format!(
            "amount {} does not match order amount {}",
            amount, stored.amount
        )));
    }

    let charge: ChargeResult = match gateway.confirm_one_off(payment_key, order_id, amount).await {
        Ok(c) => c,
        Err(e) => {
            let app_err: AppError = e.into();
            if let AppError::Gateway { code, message } = &app_err {
                log::warn!("gateway confirm failed order_id={order_id} code={code}");
                fail_transaction(pool, order_id, code, message).await?;
            }
            return Err(app_err);
        }
    };

    match approve_transaction(
        pool,
        system_wallet_address,
        order_id,
        Some(&charge.payment_key),
        charge.method.as_deref(),
        charge.approved_at,
        Some(&charge.raw),
        now,
    )
    .await?
    {
        ApproveOutcome::Applied(tx) | ApproveOutcome::AlreadyApproved(tx) => {
            log::info!("purchase approved order_id={order_id} user_id={}", tx.user_id);
            Ok(success_payload(&tx))
        }
        ApproveOutcome::WrongState(status) => Err(AppError::InvalidState(format!(
            "cannot confirm a {status} transaction"
        ))),
    }
}

pub async fn get_history(
    pool: &PgPool,
    user_id: i32,
    page: i64,
    limit: i64,
    status: Option<&str>,
) -> Result<Vec<PaymentTransaction>, AppError> {
    if let Some(s) = status {
        if !matches!(s, "PENDING" | "APPROVED" | "FAILED" | "CANCELLED") {
            return Err(AppError::InvalidArgument(format!("unknown status {s}")));
        }
    }
    let page = page.max(1);
    let limit = limit.clamp(1, 100);
    let offset = (page - 1) * limit;
    Ok(db::list_payment_transactions(pool, user_id, offset, limit, status).await?)
}

#[utoipa::path(
    post,
    path = "/api/payments/prepare",
    tag = "payments",
    request_body = PrepareRequest,
    responses(
        (status = 200, description = "Pending transaction created"),
        (status = 400, description = "Amount not in the purchase table")
    )
)]
#[post("/payments/prepare")]
pub async fn prepare(
    state: web::Data<AppState>,
    payload: web::Json<PrepareRequest>,
) -> Result<HttpResponse, AppError> {
    let tx = prepare_one_off_purchase(
        &state.pool,
        &state.system_wallet_address,
        payload.user_id,
        payload.amount,
        Utc::now(),
    )
    .await?;

    Ok(HttpResponse::Ok().json(json!({
        "order_id": tx.order_id,
        "amount": tx.amount,
        "token_amount": tx.token_amount,
        "client_key": state.toss_client_key,
    })))
}

#[utoipa::path(
    post,
    path = "/api/payments/confirm",
    tag = "payments",
    request_body = ConfirmRequest,
    responses(
        (status = 200, description = "Purchase approved and tokens credited"),
        (status = 400, description = "Amount mismatch"),
        (status = 409, description = "Transaction not confirmable"),
        (status = 502, description = "Gateway rejected the charge")
    )
)]
#[post("/payments/confirm")]
pub async fn confirm(
    state: web::Data<AppState>,
    payload: web::Json<ConfirmRequest>,
) -> Result<HttpResponse, AppError> {
    let body = confirm_one_off_purchase(
        &state.pool,
        state.gateway.as_ref(),
        &state.system_wallet_address,
        &payload.payment_key,
        &payload.order_id,
        payload.amount,
        Utc::now(),
    )
    .await?;
    Ok(HttpResponse::Ok().json(body))
}

#[get("/payments/history")]
pub async fn history(
    state: web::Data<AppState>,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse, AppError> {
    let items = get_history(
        &state.pool,
        query.user_id,
        query.page.unwrap_or(1),
        query.limit.unwrap_or(20),
        query.status.as_deref(),
    )
    .await?;
    Ok(HttpResponse::Ok().json(items))
}
