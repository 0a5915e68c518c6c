// src/api/toss_client.rs
//
// Thin client for the Toss Payments REST API (https://api.tosspayments.com).
// Authorization: Basic with the merchant secret key. No built-in retry;
// callers decide what a failed charge means.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;

use crate::error::AppError;

const TOSS_API_BASE: &str = "https://api.tosspayments.com";
const GATEWAY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum GatewayError {
    Http(reqwest::Error),
    Api { code: String, message: String },
    InvalidResponse(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Http(e) => write!(f, "http error: {e}"),
            GatewayError::Api { code, message } => {
                write!(f, "gateway rejected: code={code} message={message}")
            }
            GatewayError::InvalidResponse(e) => write!(f, "invalid response: {e}"),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value)
    }
}

impl From<GatewayError> for AppError {
    fn from(value: GatewayError) -> Self {
        match value {
            GatewayError::Api { code, message } => AppError::Gateway { code, message },
            GatewayError::Http(e) => AppError::Gateway {
                code: "HTTP_ERROR".into(),
                message: e.to_string(),
            },
            GatewayError::InvalidResponse(e) => AppError::Gateway {
                code: "INVALID_RESPONSE".into(),
                message: e,
            },
        }
    }
}

/// Result of a confirmed or recurring charge, plus the raw body for audit.
#[derive(Debug, Clone)]
pub struct ChargeResult {
    pub payment_key: String,
    pub order_id: String,
    pub method: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub requested_at: Option<DateTime<Utc>>,
    pub raw: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChargeBody {
    #[serde(rename = "paymentKey")]
    payment_key: String,
    #[serde(rename = "orderId")]
    order_id: String,
    method: Option<String>,
    #[serde(rename = "approvedAt")]
    approved_at: Option<DateTime<Utc>>,
    #[serde(rename = "requestedAt")]
    requested_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct BillingKeyBody {
    #[serde(rename = "billingKey")]
    billing_key: String,
}

/// Narrow contract the rest of the subsystem depends on. The production
/// implementation is `TossClient`; tests script this trait instead.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn confirm_one_off(
        &self,
        payment_key: &str,
        order_id: &str,
        amount: i64,
    ) -> Result<ChargeResult, GatewayError>;

    async fn issue_billing_key(
        &self,
        auth_key: &str,
        customer_key: &str,
    ) -> Result<String, GatewayError>;

    async fn delete_billing_key(
        &self,
        billing_key: &str,
        customer_key: &str,
    ) -> Result<(), GatewayError>;

    async fn charge_billing_key(
        &self,
        billing_key: &str,
        customer_key: &str,
        amount: i64,
        order_id: &str,
        order_name: &str,
    ) -> Result<ChargeResult, GatewayError>;

    fn verify_webhook_signature(&self, raw_body: &[u8], signature: &str) -> bool;
}

pub struct TossClient {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
    webhook_secret: String,
}

impl TossClient {
    pub fn new(secret_key: String, webhook_secret: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(GATEWAY_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url: TOSS_API_BASE.to_string(),
            secret_key,
            webhook_secret,
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    async fn post_charge(
        &self,
        url: String,
        body: serde_json::Value,
    ) -> Result<ChargeResult, GatewayError> {
        let resp = self
            .http
            .post(url)
            .basic_auth(&self.secret_key, Some(""))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            return Err(parse_api_error(status.as_u16(), &text));
        }

        let raw: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| GatewayError::InvalidResponse(format!("{e}; body={text}")))?;
        let parsed: ChargeBody = serde_json::from_value(raw.clone())
            .map_err(|e| GatewayError::InvalidResponse(format!("{e}; body={text}")))?;

        Ok(ChargeResult {
            payment_key: parsed.payment_key,
            order_id: parsed.order_id,
            method: parsed.method,
            approved_at: parsed.approved_at,
            requested_at: parsed.requested_at,
            raw,
        })
    }
}

fn parse_api_error(status: u16, body: &str) -> GatewayError {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(e) => GatewayError::Api {
            code: e.code,
            message: e.message,
        },
        Err(_) => GatewayError::Api {
            code: format!("HTTP_{status}"),
            message: body.to_string(),
        },
    }
}

/// HMAC-SHA256 over the raw webhook body, hex encoded. This is what the
/// provider puts in its signature header.
pub fn sign_hmac_sha256_hex(secret: &str, data: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

#[async_trait]
impl PaymentGateway for TossClient {
    async fn confirm_one_off(
        &self,
        payment_key: &str,
        order_id: &str,
        amount: i64,
    ) -> Result<ChargeResult, GatewayError> {
        self.post_charge(
            format!("{}/v1/payments/confirm", self.base_url),
            json!({
                "paymentKey": payment_key,
                "orderId": order_id,
                "amount": amount,
            }),
        )
        .await
    }

    async fn issue_billing_key(
        &self,
        auth_key: &str,
        customer_key: &str,
    ) -> Result<String, GatewayError> {
        let resp = self
            .http
            .post(format!(
                "{}/v1/billing/authorizations/issue",
                self.base_url
            ))
            .basic_auth(&self.secret_key, Some(""))
            .json(&json!({"authKey": auth_key, "customerKey": customer_key}))
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(parse_api_error(status.as_u16(), &text));
        }

        serde_json::from_str::<BillingKeyBody>(&text)
            .map(|b| b.billing_key)
            .map_err(|e| GatewayError::InvalidResponse(format!("{e}; body={text}")))
    }

    async fn delete_billing_key(
        &self,
        billing_key: &str,
        customer_key: &str,
    ) -> Result<(), GatewayError> {
        let resp = self
            .http
            .delete(format!("{}/v1/billing/{billing_key}", self.base_url))
            .basic_auth(&self.secret_key, Some(""))
            .query(&[("customerKey", customer_key)])
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() || status.as_u16() == 204 {
            return Ok(());
        }

        let text = resp.text().await.unwrap_or_default();
        Err(parse_api_error(status.as_u16(), &text))
    }

    async fn charge_billing_key(
        &self,
        billing_key: &str,
        customer_key: &str,
        amount: i64,
        order_id: &str,
        order_name: &str,
    ) -> Result<ChargeResult, GatewayError> {
        self.post_charge(
            format!("{}/v1/billing/{billing_key}", self.base_url),
            json!({
                "customerKey": customer_key,
                "amount": amount,
                "orderId": order_id,
                "orderName": order_name,
            }),
        )
        .await
    }

    fn verify_webhook_signature(&self, raw_body: &[u8], signature: &str) -> bool {
        let expected = sign_hmac_sha256_hex(&self.webhook_secret, raw_body);
        expected.eq_ignore_ascii_case(signature.trim())
    }
}
