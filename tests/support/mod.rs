#![allow(dead_code)]

use std::collections::VecDeque;
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use patronpay::AppState;
use patronpay::api::toss_client::{
    ChargeResult, GatewayError, PaymentGateway, sign_hmac_sha256_hex,
};

pub const WEBHOOK_SECRET: &str = "whsec_test";
pub const SYSTEM_WALLET: &str = "wallet_system";

fn split_db_url(url: &str) -> Result<(String, String), String> {
    let (base, query) = match url.split_once('?') {
        Some((base, query)) => (base.to_string(), Some(query)),
        None => (url.to_string(), None),
    };

    let db_start = base
        .rfind('/')
        .ok_or_else(|| "invalid database url".to_string())?;
    if db_start + 1 >= base.len() {
        return Err("database name is empty".to_string());
    }

    let db_name = base[db_start + 1..].to_string();
    let mut admin_url = format!("{}postgres", &base[..db_start + 1]);
    if let Some(query) = query {
        admin_url = format!("{admin_url}?{query}");
    }

    Ok((admin_url, db_name))
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

static TEST_DB_LOCK: OnceLock<AsyncMutex<()>> = OnceLock::new();

pub struct TestDb {
    pub pool: PgPool,
    _guard: MutexGuard<'static, ()>,
}

/// Recreates the test database and runs migrations. Returns `None` (and the
/// calling test should skip) when TEST_DATABASE_URL is not configured.
pub async fn try_init_test_db() -> Option<TestDb> {
    dotenvy::dotenv().ok();
    let test_url = match env::var("TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("TEST_DATABASE_URL not set; skipping database-backed test");
            return None;
        }
    };
    let (admin_url, db_name) = split_db_url(&test_url).expect("invalid TEST_DATABASE_URL format");

    let lock = TEST_DB_LOCK.get_or_init(|| AsyncMutex::new(()));
    let guard = lock.lock().await;

    let admin_pool = PgPool::connect(&admin_url).await.expect("connect admin db");

    let _ = sqlx::query("SELECT pg_advisory_lock(424242)")
        .execute(&admin_pool)
        .await;

    let quoted_name = quote_identifier(&db_name);
    let drop_sql = format!("DROP DATABASE IF EXISTS {quoted_name} WITH (FORCE)");
    let create_sql = format!("CREATE DATABASE {quoted_name}");

    let _ = sqlx::query(&drop_sql).execute(&admin_pool).await;
    sqlx::query(&create_sql)
        .execute(&admin_pool)
        .await
        .expect("create test db");

    let _ = sqlx::query("SELECT pg_advisory_unlock(424242)")
        .execute(&admin_pool)
        .await;
    admin_pool.close().await;

    let pool = PgPool::connect(&test_url).await.expect("connect test db");
    sqlx::migrate!().run(&pool).await.expect("migrations");
    Some(TestDb {
        pool,
        _guard: guard,
    })
}

#[derive(Debug, Clone)]
pub enum ScriptedCharge {
    Approve,
    Decline { code: String, message: String },
}

impl ScriptedCharge {
    pub fn decline(code: &str, message: &str) -> Self {
        ScriptedCharge::Decline {
            code: code.to_string(),
            message: message.to_string(),
        }
    }
}

/// Scripted stand-in for the real gateway. Outcomes are consumed in order;
/// an empty script approves everything.
pub struct MockGateway {
    confirm_script: Mutex<VecDeque<ScriptedCharge>>,
    charge_script: Mutex<VecDeque<ScriptedCharge>>,
    pub confirm_calls: AtomicUsize,
    pub charge_calls: AtomicUsize,
    pub issued_keys: Mutex<Vec<String>>,
    pub deleted_keys: Mutex<Vec<String>>,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            confirm_script: Mutex::new(VecDeque::new()),
            charge_script: Mutex::new(VecDeque::new()),
            confirm_calls: AtomicUsize::new(0),
            charge_calls: AtomicUsize::new(0),
            issued_keys: Mutex::new(Vec::new()),
            deleted_keys: Mutex::new(Vec::new()),
        })
    }

    pub fn script_confirm(&self, outcome: ScriptedCharge) {
        self.confirm_script.lock().unwrap().push_back(outcome);
    }

    pub fn script_charge(&self, outcome: ScriptedCharge) {
        self.charge_script.lock().unwrap().push_back(outcome);
    }

    fn charge_result(&self, order_id: &str, n: usize) -> ChargeResult {
        ChargeResult {
            payment_key: format!("pay_mock_{n}"),
            order_id: order_id.to_string(),
            method: Some("CARD".to_string()),
            approved_at: Some(Utc::now()),
            requested_at: Some(Utc::now()),
            raw: json!({"mock": true, "orderId": order_id}),
        }
    }

    fn next_outcome(script: &Mutex<VecDeque<ScriptedCharge>>) -> ScriptedCharge {
        script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ScriptedCharge::Approve)
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn confirm_one_off(
        &self,
        _payment_key: &str,
        order_id: &str,
        _amount: i64,
    ) -> Result<ChargeResult, GatewayError> {
        let n = self.confirm_calls.fetch_add(1, Ordering::SeqCst);
        match Self::next_outcome(&self.confirm_script) {
            ScriptedCharge::Approve => Ok(self.charge_result(order_id, n)),
            ScriptedCharge::Decline { code, message } => Err(GatewayError::Api { code, message }),
        }
    }

    async fn issue_billing_key(
        &self,
        auth_key: &str,
        _customer_key: &str,
    ) -> Result<String, GatewayError> {
        let key = format!("bill_mock_{auth_key}");
        self.issued_keys.lock().unwrap().push(key.clone());
        Ok(key)
    }

    async fn delete_billing_key(
        &self,
        billing_key: &str,
        _customer_key: &str,
    ) -> Result<(), GatewayError> {
        self.deleted_keys.lock().unwrap().push(billing_key.to_string());
        Ok(())
    }

    async fn charge_billing_key(
        &self,
        _billing_key: &str,
        _customer_key: &str,
        _amount: i64,
        order_id: &str,
        _order_name: &str,
    ) -> Result<ChargeResult, GatewayError> {
        let n = self.charge_calls.fetch_add(1, Ordering::SeqCst);
        match Self::next_outcome(&self.charge_script) {
            ScriptedCharge::Approve => Ok(self.charge_result(order_id, n)),
            ScriptedCharge::Decline { code, message } => Err(GatewayError::Api { code, message }),
        }
    }

    fn verify_webhook_signature(&self, raw_body: &[u8], signature: &str) -> bool {
        sign_hmac_sha256_hex(WEBHOOK_SECRET, raw_body).eq_ignore_ascii_case(signature.trim())
    }
}

pub fn build_state(pool: PgPool, gateway: Arc<MockGateway>) -> AppState {
    AppState {
        pool,
        gateway,
        toss_client_key: "test_ck".to_string(),
        system_wallet_address: SYSTEM_WALLET.to_string(),
    }
}

pub async fn insert_membership_item(
    pool: &PgPool,
    price: i64,
    billing_period: i32,
    billing_unit: &str,
) -> i32 {
    let row: (i32,) = sqlx::query_as(
        r#"INSERT INTO membership_items
               (creator_id, level, name, price, billing_period, billing_unit, is_active)
           VALUES (1, 1, 'Gold tier', $1, $2, $3, TRUE)
           RETURNING id"#,
    )
    .bind(price)
    .bind(billing_period)
    .bind(billing_unit)
    .fetch_one(pool)
    .await
    .expect("insert membership item");
    row.0
}

pub async fn system_wallet_balance(pool: &PgPool) -> rust_decimal::Decimal {
    let row: (rust_decimal::Decimal,) =
        sqlx::query_as("SELECT balance FROM wallets WHERE address = $1")
            .bind(SYSTEM_WALLET)
            .fetch_one(pool)
            .await
            .expect("system wallet");
    row.0
}
