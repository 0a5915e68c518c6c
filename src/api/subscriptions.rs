// src/api/subscriptions.rs

use actix_web::{HttpResponse, post, web};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use utoipa::ToSchema;

use crate::error::AppError;
use crate::{AppState, billing};

#[derive(Debug, Deserialize, ToSchema)]
pub struct PrepareSubscriptionRequest {
    pub user_id: i32,
    pub membership_item_id: i32,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ConfirmSubscriptionRequest {
    pub auth_key: String,
    pub customer_key: String,
    pub user_id: i32,
    pub membership_item_id: i32,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CancelSubscriptionRequest {
    pub user_id: i32,
    pub subscription_id: i32,
}

/// Returns the parameters the gateway's billing-auth UI needs.
/// No row is persisted until the auth key comes back via confirm.
#[post("/subscriptions/prepare")]
pub async fn prepare(
    state: web::Data<AppState>,
    payload: web::Json<PrepareSubscriptionRequest>,
) -> Result<HttpResponse, AppError> {
    let (customer_key, item) =
        billing::prepare_subscription(&state.pool, payload.user_id, payload.membership_item_id)
            .await?;

    Ok(HttpResponse::Ok().json(json!({
        "customer_key": customer_key,
        "client_key": state.toss_client_key,
        "membership_item_id": item.id,
        "order_name": item.name,
        "amount": item.price,
    })))
}

#[utoipa::path(
    post,
    path = "/api/subscriptions/confirm",
    tag = "subscriptions",
    request_body = ConfirmSubscriptionRequest,
    responses(
        (status = 200, description = "Subscription created and first charge approved"),
        (status = 409, description = "Already subscribed"),
        (status = 502, description = "Gateway rejected key issuance or first charge")
    )
)]
#[post("/subscriptions/confirm")]
pub async fn confirm(
    state: web::Data<AppState>,
    payload: web::Json<ConfirmSubscriptionRequest>,
) -> Result<HttpResponse, AppError> {
    let subscription = billing::confirm_subscription(
        &state.pool,
        state.gateway.as_ref(),
        &payload.auth_key,
        &payload.customer_key,
        payload.user_id,
        payload.membership_item_id,
        Utc::now(),
    )
    .await?;
    Ok(HttpResponse::Ok().json(subscription))
}

#[post("/subscriptions/cancel")]
pub async fn cancel(
    state: web::Data<AppState>,
    payload: web::Json<CancelSubscriptionRequest>,
) -> Result<HttpResponse, AppError> {
    billing::cancel_subscription(
        &state.pool,
        state.gateway.as_ref(),
        payload.user_id,
        payload.subscription_id,
    )
    .await?;
    Ok(HttpResponse::Ok().json(json!({"ok": true, "deferred": true})))
}

/// The scheduled external trigger. A daily job posts here; the same batch
/// also runs from the in-process scheduler when one is configured.
#[post("/billing/run")]
pub async fn run_batch(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let outcome =
        billing::run_billing_batch(&state.pool, state.gateway.as_ref(), Utc::now()).await?;
    Ok(HttpResponse::Ok().json(outcome))
}
