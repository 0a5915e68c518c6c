pub mod payments;
pub mod subscriptions;
pub mod toss_client;
pub mod webhooks;
