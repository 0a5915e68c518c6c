// src/api/webhooks.rs
//
// Gateway payment-status callbacks. Contract with the sender: verify the
// signature, normalize the payload, and never fail for an unknown order id.
// Repeat delivery of the same event must be inert, which the status-guarded
// updates in the tracker already guarantee.

use actix_web::{HttpRequest, HttpResponse, post, web};
use chrono::Utc;
use serde_json::json;

use crate::api::payments::{self, ApproveOutcome};
use crate::error::AppError;
use crate::{AppState, db};

pub const SIGNATURE_HEADER: &str = "Toss-Signature";

/// Payload fields this subsystem cares about, pulled out of the provider's
/// `{eventType, createdAt, data}` envelope (tolerating flat payloads too).
#[derive(Debug, Default, PartialEq)]
pub struct NormalizedEvent {
    pub event_type: Option<String>,
    pub order_id: Option<String>,
    pub payment_key: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatusKind {
    Approved,
    Cancelled,
    Failed,
    Unknown,
}

/// Trim + case-fold, then bucket the provider's vocabulary.
pub fn classify_status(status: &str) -> StatusKind {
    match status.trim().to_ascii_uppercase().as_str() {
        "DONE" | "APPROVED" | "SUCCESS" | "COMPLETED" | "PAID" => StatusKind::Approved,
        "CANCELED" | "CANCELLED" | "REFUNDED" | "PARTIAL_CANCELED" => StatusKind::Cancelled,
        "FAILED" | "ABORTED" | "EXPIRED" => StatusKind::Failed,
        _ => StatusKind::Unknown,
    }
}

/// JSON first, form-urlencoded as a fallback. Some provider retries arrive
/// form-encoded even when the original delivery was JSON.
pub fn parse_webhook_body(body: &[u8]) -> Option<serde_json::Value> {
    if let Ok(v) = serde_json::from_slice::<serde_json::Value>(body) {
        return Some(v);
    }
    serde_urlencoded::from_bytes::<Vec<(String, String)>>(body)
        .ok()
        .map(|pairs| {
            let map: serde_json::Map<String, serde_json::Value> = pairs
                .into_iter()
                .map(|(k, v)| (k, serde_json::Value::String(v)))
                .collect();
            serde_json::Value::Object(map)
        })
}

fn pick_str(value: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = value.get(key).and_then(|v| v.as_str()) {
            let s = s.trim();
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }
    None
}

pub fn normalize_payload(raw: &serde_json::Value) -> NormalizedEvent {
    let data = raw.get("data").filter(|d| d.is_object()).unwrap_or(raw);

    NormalizedEvent {
        event_type: pick_str(raw, &["eventType", "event_type"]),
        order_id: pick_str(data, &["orderId", "order_id"]),
        payment_key: pick_str(data, &["paymentKey", "payment_key"]),
        status: pick_str(data, &["status"]),
    }
}

fn ignored(reason: &str) -> HttpResponse {
    HttpResponse::Ok().json(json!({"ok": true, "ignored": true, "reason": reason}))
}

#[utoipa::path(
    post,
    path = "/webhook/toss",
    tag = "webhooks",
    request_body = String,
    responses(
        (status = 200, description = "Event applied or deliberately ignored"),
        (status = 401, description = "Signature verification failed")
    )
)]
#[post("/webhook/toss")]
pub async fn toss_webhook(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let signature = req
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if !state.gateway.verify_webhook_signature(&body, signature) {
        log::warn!("webhook rejected: bad signature");
        return Ok(HttpResponse::Unauthorized().json(json!({"error": "invalid signature"})));
    }

    let Some(raw) = parse_webhook_body(&body) else {
        log::warn!("webhook body unparsable; acknowledging anyway");
        return Ok(ignored("unparsable body"));
    };
    let event = normalize_payload(&raw);

    // Primary key is the stored order id; the payment key is the
    // caller-supplied fallback.
    let stored = match (&event.order_id, &event.payment_key) {
        (Some(order_id), _) => db::get_payment_transaction_by_order_id(&state.pool, order_id).await?,
        (None, Some(payment_key)) => {
            db::get_payment_transaction_by_payment_key(&state.pool, payment_key).await?
        }
        (None, None) => {
            log::warn!("webhook without order or payment key: {:?}", event.event_type);
            return Ok(ignored("no lookup key"));
        }
    };

    // Unknown entity is a no-op success so the sender stops retrying.
    let Some(stored) = stored else {
        log::info!(
            "webhook for unknown transaction order_id={:?} payment_key={:?}",
            event.order_id,
            event.payment_key
        );
        return Ok(ignored("unknown transaction"));
    };

    let status = event.status.as_deref().unwrap_or_default();
    match classify_status(status) {
        StatusKind::Approved => {
            let outcome = payments::approve_transaction(
                &state.pool,
                &state.system_wallet_address,
                &stored.order_id,
                event.payment_key.as_deref(),
                None,
                None,
                Some(&raw),
                Utc::now(),
            )
            .await?;
            match outcome {
                ApproveOutcome::Applied(_) => {
                    log::info!("webhook approved order_id={}", stored.order_id);
                }
                ApproveOutcome::AlreadyApproved(_) => {
                    log::info!("webhook replay ignored order_id={}", stored.order_id);
                }
                ApproveOutcome::WrongState(s) => {
                    log::warn!(
                        "webhook approval for {s} transaction ignored order_id={}",
                        stored.order_id
                    );
                }
            }
            Ok(HttpResponse::Ok().json(json!({"ok": true})))
        }
        StatusKind::Cancelled => {
            // Refunds flip APPROVED to CANCELLED; an abandoned PENDING
            // payment cancels the same way. No ledger clawback here.
            let updated = sqlx::query(
                r#"UPDATE payment_transactions
                   SET status = 'CANCELLED', cancelled_at = NOW(),
                       raw_response = COALESCE($2, raw_response)
                   WHERE order_id = $1 AND status IN ('PENDING', 'APPROVED')"#,
            )
            .bind(&stored.order_id)
            .bind(&raw)
            .execute(&state.pool)
            .await?;
            if updated.rows_affected() > 0 {
                log::info!("webhook cancelled order_id={}", stored.order_id);
            }
            Ok(HttpResponse::Ok().json(json!({"ok": true})))
        }
        StatusKind::Failed => {
            payments::fail_transaction(
                &state.pool,
                &stored.order_id,
                "WEBHOOK_FAILED",
                &format!("gateway reported {status}"),
            )
            .await?;
            Ok(HttpResponse::Ok().json(json!({"ok": true})))
        }
        StatusKind::Unknown => {
            log::info!(
                "webhook with unhandled status {status:?} order_id={}",
                stored.order_id
            );
            Ok(ignored("unhandled status"))
        }
    }
}
