pub mod api;
pub mod billing;
pub mod db;
pub mod docs;
pub mod error;
pub mod ledger;
pub mod models;

use std::sync::Arc;

use sqlx::PgPool;

use crate::api::toss_client::PaymentGateway;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub gateway: Arc<dyn PaymentGateway>,
    /// Public client key handed to the gateway's browser SDK.
    pub toss_client_key: String,
    /// Address of the wallet holding the token supply. Injected through
    /// configuration, never looked up by a sentinel owner.
    pub system_wallet_address: String,
}
