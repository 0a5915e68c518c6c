use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::api::payments::prepare,
        crate::api::payments::confirm,
        crate::api::subscriptions::confirm,
        crate::api::webhooks::toss_webhook
    ),
    components(
        schemas(
            crate::api::payments::PrepareRequest,
            crate::api::payments::ConfirmRequest,
            crate::api::subscriptions::PrepareSubscriptionRequest,
            crate::api::subscriptions::ConfirmSubscriptionRequest,
            crate::api::subscriptions::CancelSubscriptionRequest,
            crate::models::PaymentTransaction,
            crate::models::Subscription
        )
    ),
    tags(
        (name = "payments", description = "One-off token purchases"),
        (name = "subscriptions", description = "Recurring memberships"),
        (name = "webhooks", description = "Gateway callbacks")
    )
)]
pub struct ApiDoc;
