use chrono::{DateTime, Duration, TimeZone, Utc};

use patronpay::billing;
use patronpay::db;
use patronpay::error::AppError;

mod support;
use support::ScriptedCharge;

async fn seed_subscription(
    pool: &sqlx::PgPool,
    subscriber_id: i32,
    membership_item_id: i32,
    amount: i64,
    billing_key: Option<&str>,
    auto_renew: bool,
    next_billing_date: DateTime<Utc>,
    payment_failure_count: i32,
) -> i32 {
    let row: (i32,) = sqlx::query_as(
        r#"INSERT INTO subscriptions
               (subscriber_id, membership_item_id, amount, billing_key, status,
                auto_renew, next_billing_date, payment_failure_count, started_at)
           VALUES ($1, $2, $3, $4, 'ONGOING', $5, $6, $7, NOW())
           RETURNING id"#,
    )
    .bind(subscriber_id)
    .bind(membership_item_id)
    .bind(amount)
    .bind(billing_key)
    .bind(auto_renew)
    .bind(next_billing_date)
    .bind(payment_failure_count)
    .fetch_one(pool)
    .await
    .expect("seed subscription");
    row.0
}

#[actix_web::test]
async fn confirm_subscription_creates_row_and_first_charge() {
    let Some(test_db) = support::try_init_test_db().await else {
        return;
    };
    let pool = &test_db.pool;
    let gateway = support::MockGateway::new();
    let item = support::insert_membership_item(pool, 9_900, 1, "MONTH").await;

    let now = Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap();
    let sub = billing::confirm_subscription(
        pool,
        gateway.as_ref(),
        "auth_1",
        "customer_100",
        100,
        item,
        now,
    )
    .await
    .expect("confirm subscription");

    assert_eq!(sub.status, "ONGOING");
    assert!(sub.auto_renew);
    assert_eq!(sub.amount, 9_900);
    assert_eq!(sub.billing_key.as_deref(), Some("bill_mock_auth_1"));
    assert_eq!(
        sub.next_billing_date,
        Some(Utc.with_ymd_and_hms(2024, 4, 15, 10, 0, 0).unwrap())
    );
    assert_eq!(sub.payment_failure_count, 0);

    // First charge lands as a recurring APPROVED transaction with no tokens.
    let tx: (String, bool, rust_decimal::Decimal) = sqlx::query_as(
        r#"SELECT status, is_recurring, token_amount
           FROM payment_transactions WHERE subscription_id = $1"#,
    )
    .bind(sub.id)
    .fetch_one(pool)
    .await
    .unwrap();
    assert_eq!(tx.0, "APPROVED");
    assert!(tx.1);
    assert_eq!(tx.2, rust_decimal::Decimal::ZERO);

    // Second confirm for the same membership conflicts.
    let dup = billing::confirm_subscription(
        pool,
        gateway.as_ref(),
        "auth_2",
        "customer_100",
        100,
        item,
        now,
    )
    .await;
    assert!(matches!(dup, Err(AppError::Conflict(_))));
}

#[actix_web::test]
async fn failed_first_charge_leaves_no_subscription() {
    let Some(test_db) = support::try_init_test_db().await else {
        return;
    };
    let pool = &test_db.pool;
    let gateway = support::MockGateway::new();
    gateway.script_charge(ScriptedCharge::decline("INSUFFICIENT_FUNDS", "no balance"));
    let item = support::insert_membership_item(pool, 9_900, 1, "MONTH").await;

    let err = billing::confirm_subscription(
        pool,
        gateway.as_ref(),
        "auth_3",
        "customer_101",
        101,
        item,
        Utc::now(),
    )
    .await;
    assert!(matches!(err, Err(AppError::Gateway { .. })));

    let count: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM subscriptions WHERE subscriber_id = 101")
            .fetch_one(pool)
            .await
            .unwrap();
    assert_eq!(count.0, 0);
    // The freshly issued billing key was released.
    assert_eq!(
        gateway.deleted_keys.lock().unwrap().as_slice(),
        ["bill_mock_auth_3"]
    );
}

#[actix_web::test]
async fn prepare_subscription_validates_and_creates_nothing() {
    let Some(test_db) = support::try_init_test_db().await else {
        return;
    };
    let pool = &test_db.pool;
    let item = support::insert_membership_item(pool, 4_900, 1, "MONTH").await;

    let (customer_key, membership) = billing::prepare_subscription(pool, 200, item)
        .await
        .expect("prepare");
    assert_eq!(customer_key, "customer_200");
    assert_eq!(membership.price, 4_900);

    let missing = billing::prepare_subscription(pool, 200, 9999).await;
    assert!(matches!(missing, Err(AppError::NotFound("membership item"))));

    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM subscriptions")
        .fetch_one(pool)
        .await
        .unwrap();
    assert_eq!(count.0, 0);
}

#[actix_web::test]
async fn batch_renews_due_subscription_and_resets_failures() {
    let Some(test_db) = support::try_init_test_db().await else {
        return;
    };
    let pool = &test_db.pool;
    let gateway = support::MockGateway::new();
    let item = support::insert_membership_item(pool, 9_900, 1, "MONTH").await;

    let due_date = Utc.with_ymd_and_hms(2024, 5, 31, 9, 0, 0).unwrap();
    let sub_id = seed_subscription(pool, 300, item, 9_900, Some("bk_300"), true, due_date, 1).await;

    let now = due_date + Duration::hours(3);
    let outcome = billing::run_billing_batch(pool, gateway.as_ref(), now)
        .await
        .expect("batch");
    assert_eq!(outcome.processed, 1);
    assert_eq!(outcome.succeeded, 1);
    assert_eq!(outcome.failed, 0);

    let sub = db::get_subscription(pool, sub_id).await.unwrap().unwrap();
    // Advanced one calendar month from the due date, day clamped to June 30.
    assert_eq!(
        sub.next_billing_date,
        Some(Utc.with_ymd_and_hms(2024, 6, 30, 9, 0, 0).unwrap())
    );
    assert_eq!(sub.payment_failure_count, 0);
    assert_eq!(sub.last_payment_date, Some(now));
    assert_eq!(sub.status, "ONGOING");

    let tx_count: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM payment_transactions WHERE subscription_id = $1 AND status = 'APPROVED'",
    )
    .bind(sub_id)
    .fetch_one(pool)
    .await
    .unwrap();
    assert_eq!(tx_count.0, 1);
}

#[actix_web::test]
async fn third_failure_cancels_and_excludes_from_next_run() {
    let Some(test_db) = support::try_init_test_db().await else {
        return;
    };
    let pool = &test_db.pool;
    let gateway = support::MockGateway::new();
    gateway.script_charge(ScriptedCharge::decline("PAY_PROCESS_CANCELED", "declined"));
    let item = support::insert_membership_item(pool, 9_900, 1, "MONTH").await;

    // Second precision so the value round-trips through timestamptz intact.
    let due_date = DateTime::from_timestamp(Utc::now().timestamp() - 86_400, 0).unwrap();
    let sub_id = seed_subscription(pool, 301, item, 9_900, Some("bk_301"), true, due_date, 2).await;

    let outcome = billing::run_billing_batch(pool, gateway.as_ref(), Utc::now())
        .await
        .unwrap();
    assert_eq!(outcome.processed, 1);
    assert_eq!(outcome.failed, 1);

    let sub = db::get_subscription(pool, sub_id).await.unwrap().unwrap();
    assert_eq!(sub.status, "CANCELLED");
    assert!(!sub.auto_renew);
    assert!(sub.ended_at.is_some());
    assert_eq!(sub.payment_failure_count, 3);
    // next_billing_date untouched by the failure path.
    assert_eq!(sub.next_billing_date, Some(due_date));

    let failed_tx: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM payment_transactions WHERE subscription_id = $1 AND status = 'FAILED'",
    )
    .bind(sub_id)
    .fetch_one(pool)
    .await
    .unwrap();
    assert_eq!(failed_tx.0, 1);

    // Cancelled subscription is gone from the next selection set.
    let again = billing::run_billing_batch(pool, gateway.as_ref(), Utc::now())
        .await
        .unwrap();
    assert_eq!(again.processed, 0);
}

#[actix_web::test]
async fn one_declined_subscription_does_not_abort_the_rest() {
    let Some(test_db) = support::try_init_test_db().await else {
        return;
    };
    let pool = &test_db.pool;
    let gateway = support::MockGateway::new();
    gateway.script_charge(ScriptedCharge::decline("REJECT_CARD_COMPANY", "declined"));
    // second scripted call falls through to Approve
    let item = support::insert_membership_item(pool, 9_900, 1, "MONTH").await;

    let due = Utc::now() - Duration::hours(1);
    let first = seed_subscription(pool, 302, item, 9_900, Some("bk_302"), true, due, 0).await;
    let second =
        seed_subscription(pool, 303, item, 9_900, Some("bk_303"), true, due + Duration::minutes(1), 0)
            .await;

    let outcome = billing::run_billing_batch(pool, gateway.as_ref(), Utc::now())
        .await
        .unwrap();
    assert_eq!(outcome.processed, 2);
    assert_eq!(outcome.succeeded, 1);
    assert_eq!(outcome.failed, 1);

    let failed = db::get_subscription(pool, first).await.unwrap().unwrap();
    assert_eq!(failed.payment_failure_count, 1);
    assert_eq!(failed.status, "ONGOING");

    let renewed = db::get_subscription(pool, second).await.unwrap().unwrap();
    assert_eq!(renewed.payment_failure_count, 0);
    assert!(renewed.last_payment_date.is_some());
}

#[actix_web::test]
async fn cancellation_is_deferred_then_expires() {
    let Some(test_db) = support::try_init_test_db().await else {
        return;
    };
    let pool = &test_db.pool;
    let gateway = support::MockGateway::new();
    let item = support::insert_membership_item(pool, 9_900, 1, "MONTH").await;

    let period_end = DateTime::from_timestamp(Utc::now().timestamp() + 10 * 86_400, 0).unwrap();
    let sub_id =
        seed_subscription(pool, 304, item, 9_900, Some("bk_304"), true, period_end, 0).await;

    // Wrong owner cannot cancel.
    let stranger = billing::cancel_subscription(pool, gateway.as_ref(), 999, sub_id).await;
    assert!(matches!(stranger, Err(AppError::NotFound("subscription"))));

    billing::cancel_subscription(pool, gateway.as_ref(), 304, sub_id)
        .await
        .expect("cancel");
    assert_eq!(gateway.deleted_keys.lock().unwrap().as_slice(), ["bk_304"]);

    // Still ONGOING until the paid period elapses.
    let sub = db::get_subscription(pool, sub_id).await.unwrap().unwrap();
    assert_eq!(sub.status, "ONGOING");
    assert!(!sub.auto_renew);
    assert!(sub.billing_key.is_none());

    let batch_now = period_end + Duration::hours(1);
    let outcome = billing::run_billing_batch(pool, gateway.as_ref(), batch_now)
        .await
        .unwrap();
    assert_eq!(outcome.processed, 0);
    assert_eq!(outcome.expired, 1);

    let sub = db::get_subscription(pool, sub_id).await.unwrap().unwrap();
    assert_eq!(sub.status, "EXPIRED");
    assert_eq!(sub.ended_at, Some(batch_now));

    let again = billing::cancel_subscription(pool, gateway.as_ref(), 304, sub_id).await;
    assert!(matches!(again, Err(AppError::InvalidState(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_subscription_confirms_leave_one_ongoing_row() {
    let Some(test_db) = support::try_init_test_db().await else {
        return;
    };
    let pool = test_db.pool.clone();
    let gateway = support::MockGateway::new();
    let item = support::insert_membership_item(&pool, 9_900, 1, "MONTH").await;

    let mut handles = Vec::new();
    for auth_key in ["auth_race_a", "auth_race_b"] {
        let pool = pool.clone();
        let gateway = gateway.clone();
        handles.push(tokio::spawn(async move {
            billing::confirm_subscription(
                &pool,
                gateway.as_ref(),
                auth_key,
                "customer_400",
                400,
                item,
                Utc::now(),
            )
            .await
        }));
    }

    let mut ok = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.expect("join") {
            Ok(_) => ok += 1,
            Err(AppError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(conflicts, 1);

    let ongoing: Vec<(Option<String>,)> = sqlx::query_as(
        "SELECT billing_key FROM subscriptions WHERE subscriber_id = 400 AND status = 'ONGOING'",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(ongoing.len(), 1);
    let survivor = ongoing[0].0.clone().expect("billing key");

    // Every billing key issued for the loser was released again; the
    // survivor's key is still live.
    let issued = gateway.issued_keys.lock().unwrap().clone();
    let deleted = gateway.deleted_keys.lock().unwrap().clone();
    assert!(issued.contains(&survivor));
    assert!(!deleted.contains(&survivor));
    for key in issued {
        assert!(key == survivor || deleted.contains(&key));
    }
}
