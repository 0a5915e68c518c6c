// src/main.rs

use std::env;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{App, HttpResponse, HttpServer, Responder, web};
use chrono::Utc;
use dotenvy::dotenv;
use sqlx::PgPool;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use patronpay::api::toss_client::TossClient;
use patronpay::{AppState, api, billing, docs};

async fn index() -> impl Responder {
    HttpResponse::Ok().body("Service ready!")
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPool::connect(&database_url)
        .await
        .expect("Failed to connect to DB");

    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let toss_secret_key = env::var("TOSS_SECRET_KEY").expect("TOSS_SECRET_KEY required");
    let toss_client_key = env::var("TOSS_CLIENT_KEY").expect("TOSS_CLIENT_KEY required");
    let toss_webhook_secret =
        env::var("TOSS_WEBHOOK_SECRET").expect("TOSS_WEBHOOK_SECRET required");
    let system_wallet_address =
        env::var("SYSTEM_WALLET_ADDRESS").unwrap_or_else(|_| "wallet_system".to_string());

    let gateway = Arc::new(TossClient::new(toss_secret_key, toss_webhook_secret));

    let state = web::Data::new(AppState {
        pool: pool.clone(),
        gateway,
        toss_client_key,
        system_wallet_address,
    });

    // In-process fallback for the scheduled trigger. A cron posting to
    // /internal/billing/run does the same thing.
    if let Ok(secs) = env::var("BILLING_SCHEDULER_INTERVAL_SECS") {
        let interval = secs
            .parse::<u64>()
            .expect("BILLING_SCHEDULER_INTERVAL_SECS must be a number");
        let scheduler_state = state.clone();
        actix_web::rt::spawn(async move {
            loop {
                actix_web::rt::time::sleep(Duration::from_secs(interval)).await;
                match billing::run_billing_batch(
                    &scheduler_state.pool,
                    scheduler_state.gateway.as_ref(),
                    Utc::now(),
                )
                .await
                {
                    Ok(outcome) => log::info!(
                        "scheduled billing run: processed={} succeeded={} failed={}",
                        outcome.processed,
                        outcome.succeeded,
                        outcome.failed
                    ),
                    Err(e) => log::error!("scheduled billing run error: {e}"),
                }
            }
        });
    }

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/", web::get().to(index))
            .service(
                SwaggerUi::new("/docs/{_:.*}")
                    .url("/api-docs/openapi.json", docs::ApiDoc::openapi()),
            )
            .service(
                web::scope("/api")
                    .service(api::payments::prepare)
                    .service(api::payments::confirm)
                    .service(api::payments::history)
                    .service(api::subscriptions::prepare)
                    .service(api::subscriptions::confirm)
                    .service(api::subscriptions::cancel),
            )
            .service(web::scope("/internal").service(api::subscriptions::run_batch))
            // Webhooks are public; the signature check is the gate.
            .service(api::webhooks::toss_webhook)
    })
    .bind(("0.0.0.0", 8080))?
    .run()
    .await
}
