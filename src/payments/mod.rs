use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::AppResult;

pub mod stripe;
pub mod webhook;

pub use stripe::StripeGateway;
pub use webhook::{GatewayEvent, construct_event};

/// Client-side interface to the payment gateway. Constructed once per
/// process and injected through `AppState`; implementations must not rely
/// on ambient global configuration.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a payment intent and return its client secret.
    async fn create_intent(
        &self,
        amount: Decimal,
        currency: &str,
        metadata: &HashMap<String, String>,
    ) -> AppResult<String>;

    /// Check whether the intent has reached the succeeded state.
    async fn confirm(&self, intent_id: &str) -> AppResult<bool>;

    /// Refund an intent, fully when `amount` is `None`.
    async fn refund(&self, intent_id: &str, amount: Option<Decimal>) -> AppResult<bool>;
}
