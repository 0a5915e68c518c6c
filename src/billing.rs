// src/billing.rs
//
// Subscription Billing Engine: billing-key issuance, first charge, deferred
// cancellation and the recurring batch run. Subscription charges never touch
// the ledger; the value delivered is the membership itself.

use chrono::{DateTime, Duration, Months, Utc};
use serde::Serialize;
use sqlx::PgPool;

use crate::api::payments::new_order_id;
use crate::api::toss_client::{ChargeResult, GatewayError, PaymentGateway};
use crate::db;
use crate::error::{AppError, is_unique_violation};
use crate::models::{MembershipItem, Subscription};

/// Consecutive failed charges after which a subscription is force-cancelled.
pub const MAX_PAYMENT_FAILURES: i32 = 3;

pub fn customer_key(user_id: i32) -> String {
    format!("customer_{user_id}")
}

/// Advances a billing date by one membership period. MONTH and YEAR add
/// calendar months, which may clamp the day-of-month (Jan 31 + 1 month =
/// Feb 28/29); that shift is accepted, not corrected. `None` for an unknown
/// unit or out-of-range date.
pub fn advance_billing_date(
    from: DateTime<Utc>,
    billing_period: i32,
    billing_unit: &str,
) -> Option<DateTime<Utc>> {
    if billing_period <= 0 {
        return None;
    }
    match billing_unit {
        "DAY" => from.checked_add_signed(Duration::days(i64::from(billing_period))),
        "MONTH" => from.checked_add_months(Months::new(billing_period as u32)),
        "YEAR" => from.checked_add_months(Months::new(12 * billing_period as u32)),
        _ => None,
    }
}

fn next_date_or_invalid(
    from: DateTime<Utc>,
    item: &MembershipItem,
) -> Result<DateTime<Utc>, AppError> {
    advance_billing_date(from, item.billing_period, &item.billing_unit).ok_or_else(|| {
        AppError::InvalidArgument(format!(
            "membership item {} has unusable billing period {} {}",
            item.id, item.billing_period, item.billing_unit
        ))
    })
}

async fn active_membership_item(
    pool: &PgPool,
    membership_item_id: i32,
) -> Result<MembershipItem, AppError> {
    let item = db::get_membership_item(pool, membership_item_id)
        .await?
        .ok_or(AppError::NotFound("membership item"))?;
    if !item.is_active {
        return Err(AppError::InvalidState(format!(
            "membership item {membership_item_id} is not active"
        )));
    }
    Ok(item)
}

/// Pre-checks before the gateway's billing-auth UI is shown. Creates no
/// persistent row; the returned customer key scopes the billing key the
/// gateway will issue.
pub async fn prepare_subscription(
    pool: &PgPool,
    user_id: i32,
    membership_item_id: i32,
) -> Result<(String, MembershipItem), AppError> {
    let item = active_membership_item(pool, membership_item_id).await?;

    if db::find_ongoing_subscription(pool, user_id, membership_item_id)
        .await?
        .is_some()
    {
        return Err(AppError::Conflict(format!(
            "user {user_id} already subscribes to membership item {membership_item_id}"
        )));
    }

    Ok((customer_key(user_id), item))
}

async fn insert_recurring_transaction(
    conn: &mut sqlx::PgConnection,
    user_id: i32,
    subscription_id: Option<i32>,
    billing_key: &str,
    order_id: &str,
    amount: i64,
    charge: Option<&ChargeResult>,
    failure: Option<(&str, &str)>,
) -> Result<(), AppError> {
    let (status, payment_key, method, approved_at, raw) = match charge {
        Some(c) => (
            "APPROVED",
            Some(c.payment_key.as_str()),
            c.method.as_deref(),
            c.approved_at,
            Some(c.raw.clone()),
        ),
        None => ("FAILED", None, None, None, None),
    };
    let (failure_code, failure_message) = match failure {
        Some((code, message)) => (Some(code), Some(message)),
        None => (None, None),
    };

    sqlx::query(
        r#"INSERT INTO payment_transactions
               (order_id, payment_key, user_id, amount, token_amount, subscription_id,
                billing_key, is_recurring, status, method, approved_at,
                failure_code, failure_message, raw_response)
           VALUES ($1, $2, $3, $4, 0, $5, $6, TRUE, $7, $8, $9, $10, $11, $12)"#,
    )
    .bind(order_id)
    .bind(payment_key)
    .bind(user_id)
    .bind(amount)
    .bind(subscription_id)
    .bind(billing_key)
    .bind(status)
    .bind(method)
    .bind(approved_at)
    .bind(failure_code)
    .bind(failure_message)
    .bind(raw)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Issues a billing key, performs the first charge, and only then persists
/// the subscription. A failed first charge leaves no ONGOING row behind; the
/// freshly issued billing key is released best-effort. The same cleanup runs
/// when persistence fails after a successful charge, including losing the
/// insert race to a concurrent confirm for the same membership.
pub async fn confirm_subscription(
    pool: &PgPool,
    gateway: &dyn PaymentGateway,
    auth_key: &str,
    customer_key_value: &str,
    user_id: i32,
    membership_item_id: i32,
    now: DateTime<Utc>,
) -> Result<Subscription, AppError> {
    let item = active_membership_item(pool, membership_item_id).await?;
    let next_billing_date = next_date_or_invalid(now, &item)?;

    if db::find_ongoing_subscription(pool, user_id, membership_item_id)
        .await?
        .is_some()
    {
        return Err(AppError::Conflict(format!(
            "user {user_id} already subscribes to membership item {membership_item_id}"
        )));
    }

    let billing_key = gateway
        .issue_billing_key(auth_key, customer_key_value)
        .await
        .map_err(AppError::from)?;

    let order_id = new_order_id(user_id, now);
    let charge = match gateway
        .charge_billing_key(&billing_key, customer_key_value, item.price, &order_id, &item.name)
        .await
    {
        Ok(c) => c,
        Err(e) => {
            if let Err(del) = gateway.delete_billing_key(&billing_key, customer_key_value).await {
                log::warn!("billing key cleanup failed customer={customer_key_value}: {del}");
            }
            log::warn!("first subscription charge failed user_id={user_id}: {e}");
            return Err(e.into());
        }
    };

    let persisted = persist_subscription(
        pool,
        user_id,
        membership_item_id,
        &item,
        &billing_key,
        &order_id,
        &charge,
        next_billing_date,
        now,
    )
    .await;

    let subscription = match persisted {
        Ok(sub) => sub,
        Err(e) => {
            if let Err(del) = gateway.delete_billing_key(&billing_key, customer_key_value).await {
                log::warn!("billing key cleanup failed customer={customer_key_value}: {del}");
            }
            log::error!(
                "charged but not persisted user_id={user_id} order_id={order_id}: {e}; \
                 charge needs reconciliation"
            );
            return Err(e);
        }
    };

    log::info!(
        "subscription created id={} user_id={user_id} item={membership_item_id}",
        subscription.id
    );
    Ok(subscription)
}

async fn persist_subscription(
    pool: &PgPool,
    user_id: i32,
    membership_item_id: i32,
    item: &MembershipItem,
    billing_key: &str,
    order_id: &str,
    charge: &ChargeResult,
    next_billing_date: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Subscription, AppError> {
    let mut tx = pool.begin().await?;
    let subscription = sqlx::query_as::<_, Subscription>(
        r#"INSERT INTO subscriptions
               (subscriber_id, membership_item_id, amount, billing_key, status,
                auto_renew, next_billing_date, last_payment_date,
                payment_failure_count, started_at)
           VALUES ($1, $2, $3, $4, 'ONGOING', TRUE, $5, $6, 0, $6)
           RETURNING id, subscriber_id, membership_item_id, amount, billing_key,
                     status, auto_renew, next_billing_date, last_payment_date,
                     payment_failure_count, started_at, ended_at"#,
    )
    .bind(user_id)
    .bind(membership_item_id)
    .bind(item.price)
    .bind(billing_key)
    .bind(next_billing_date)
    .bind(now)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e, "subscriptions_ongoing_idx") {
            AppError::Conflict(format!(
                "user {user_id} already subscribes to membership item {membership_item_id}"
            ))
        } else {
            AppError::Db(e)
        }
    })?;

    insert_recurring_transaction(
        &mut *tx,
        user_id,
        Some(subscription.id),
        billing_key,
        order_id,
        item.price,
        Some(charge),
        None,
    )
    .await?;
    tx.commit().await?;
    Ok(subscription)
}

/// Deferred cancellation: the billing key is deleted at the gateway and
/// auto-renew stops, but the subscription stays ONGOING and usable until its
/// paid period elapses. The batch then expires it.
pub async fn cancel_subscription(
    pool: &PgPool,
    gateway: &dyn PaymentGateway,
    user_id: i32,
    subscription_id: i32,
) -> Result<(), AppError> {
    let sub = db::get_subscription(pool, subscription_id)
        .await?
        .ok_or(AppError::NotFound("subscription"))?;
    if sub.subscriber_id != user_id {
        return Err(AppError::NotFound("subscription"));
    }
    if sub.status != "ONGOING" {
        return Err(AppError::InvalidState(format!(
            "cannot cancel a {} subscription",
            sub.status
        )));
    }

    if let Some(billing_key) = sub.billing_key.as_deref() {
        gateway
            .delete_billing_key(billing_key, &customer_key(user_id))
            .await
            .map_err(AppError::from)?;
    }

    sqlx::query(
        r#"UPDATE subscriptions
           SET auto_renew = FALSE, billing_key = NULL
           WHERE id = $1 AND status = 'ONGOING'"#,
    )
    .bind(subscription_id)
    .execute(pool)
    .await?;

    log::info!("subscription cancel scheduled id={subscription_id} user_id={user_id}");
    Ok(())
}

#[derive(Debug, Default, Serialize)]
pub struct BatchOutcome {
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub expired: u32,
}

enum ChargeAttempt {
    Success,
    Failure,
}

/// Charges every due subscription independently: one subscription's failure
/// never aborts the rest of the run. Also expires deferred-cancelled
/// subscriptions whose paid period has elapsed.
pub async fn run_billing_batch(
    pool: &PgPool,
    gateway: &dyn PaymentGateway,
    now: DateTime<Utc>,
) -> Result<BatchOutcome, AppError> {
    let due = db::list_due_subscriptions(pool, now).await?;
    let mut outcome = BatchOutcome::default();

    for sub in due {
        outcome.processed += 1;
        match bill_one(pool, gateway, &sub, now).await {
            Ok(ChargeAttempt::Success) => outcome.succeeded += 1,
            Ok(ChargeAttempt::Failure) => outcome.failed += 1,
            Err(e) => {
                // Bookkeeping errors count as a failure for this run but the
                // failure counter only moves on a gateway-declined charge.
                log::error!("billing run error subscription_id={}: {e}", sub.id);
                outcome.failed += 1;
            }
        }
    }

    for sub in db::list_expirable_subscriptions(pool, now).await? {
        let updated = sqlx::query(
            r#"UPDATE subscriptions
               SET status = 'EXPIRED', ended_at = $2
               WHERE id = $1 AND status = 'ONGOING' AND auto_renew = FALSE"#,
        )
        .bind(sub.id)
        .bind(now)
        .execute(pool)
        .await?;
        if updated.rows_affected() > 0 {
            log::info!("subscription expired id={}", sub.id);
            outcome.expired += 1;
        }
    }

    log::info!(
        "billing batch done processed={} succeeded={} failed={} expired={}",
        outcome.processed,
        outcome.succeeded,
        outcome.failed,
        outcome.expired
    );
    Ok(outcome)
}

async fn bill_one(
    pool: &PgPool,
    gateway: &dyn PaymentGateway,
    sub: &Subscription,
    now: DateTime<Utc>,
) -> Result<ChargeAttempt, AppError> {
    let item = db::get_membership_item(pool, sub.membership_item_id)
        .await?
        .ok_or(AppError::NotFound("membership item"))?;
    let billing_key = sub
        .billing_key
        .as_deref()
        .ok_or(AppError::InvalidState("subscription has no billing key".into()))?;

    let order_id = new_order_id(sub.subscriber_id, now);
    let key = customer_key(sub.subscriber_id);

    match gateway
        .charge_billing_key(billing_key, &key, item.price, &order_id, &item.name)
        .await
    {
        Ok(charge) => {
            let base = sub.next_billing_date.unwrap_or(now);
            let next = next_date_or_invalid(base, &item)?;

            let mut tx = pool.begin().await?;
            sqlx::query(
                r#"UPDATE subscriptions
                   SET next_billing_date = $2, last_payment_date = $3,
                       payment_failure_count = 0
                   WHERE id = $1 AND status = 'ONGOING'"#,
            )
            .bind(sub.id)
            .bind(next)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            insert_recurring_transaction(
                &mut *tx,
                sub.subscriber_id,
                Some(sub.id),
                billing_key,
                &order_id,
                item.price,
                Some(&charge),
                None,
            )
            .await?;
            tx.commit().await?;

            log::info!("recurring charge ok subscription_id={} next={next}", sub.id);
            Ok(ChargeAttempt::Success)
        }
        Err(e) => {
            let (code, message) = match &e {
                GatewayError::Api { code, message } => (code.clone(), message.clone()),
                other => ("GATEWAY_UNAVAILABLE".to_string(), other.to_string()),
            };
            log::warn!(
                "recurring charge failed subscription_id={} code={code}",
                sub.id
            );

            let failures = sub.payment_failure_count + 1;
            let mut tx = pool.begin().await?;
            if failures >= MAX_PAYMENT_FAILURES {
                sqlx::query(
                    r#"UPDATE subscriptions
                       SET payment_failure_count = $2, status = 'CANCELLED',
                           auto_renew = FALSE, ended_at = $3
                       WHERE id = $1 AND status = 'ONGOING'"#,
                )
                .bind(sub.id)
                .bind(failures)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                log::warn!(
                    "subscription cancelled after {failures} failed charges id={}",
                    sub.id
                );
            } else {
                // next_billing_date stays put so the next run retries.
                sqlx::query(
                    r#"UPDATE subscriptions
                       SET payment_failure_count = $2
                       WHERE id = $1 AND status = 'ONGOING'"#,
                )
                .bind(sub.id)
                .bind(failures)
                .execute(&mut *tx)
                .await?;
            }
            insert_recurring_transaction(
                &mut *tx,
                sub.subscriber_id,
                Some(sub.id),
                billing_key,
                &order_id,
                item.price,
                None,
                Some((&code, &message)),
            )
            .await?;
            tx.commit().await?;

            Ok(ChargeAttempt::Failure)
        }
    }
}
