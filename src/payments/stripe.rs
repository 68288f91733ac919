use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;

use crate::error::{AppError, AppResult};

use super::PaymentGateway;

const API_BASE: &str = "https://api.stripe.com/v1";

/// Stripe client. Holds its own `reqwest::Client` and secret key; nothing is
/// read from process-global configuration after construction.
pub struct StripeGateway {
    client: reqwest::Client,
    secret_key: String,
}

#[derive(Debug, Deserialize)]
struct IntentResponse {
    client_secret: String,
}

#[derive(Debug, Deserialize)]
struct IntentStatusResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    status: String,
}

impl StripeGateway {
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            secret_key: secret_key.into(),
        }
    }

    async fn post_form<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> AppResult<T> {
        let resp = self
            .client
            .post(format!("{API_BASE}/{path}"))
            .basic_auth(&self.secret_key, None::<&str>)
            .form(form)
            .send()
            .await
            .map_err(|e| AppError::Gateway(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::Gateway(format!("{status}: {body}")));
        }
        resp.json::<T>()
            .await
            .map_err(|e| AppError::Gateway(e.to_string()))
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> AppResult<T> {
        let resp = self
            .client
            .get(format!("{API_BASE}/{path}"))
            .basic_auth(&self.secret_key, None::<&str>)
            .send()
            .await
            .map_err(|e| AppError::Gateway(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::Gateway(format!("{status}: {body}")));
        }
        resp.json::<T>()
            .await
            .map_err(|e| AppError::Gateway(e.to_string()))
    }
}

// Stripe amounts are integers in minor currency units.
fn to_minor_units(amount: Decimal) -> AppResult<i64> {
    (amount * Decimal::from(100))
        .round()
        .to_i64()
        .ok_or_else(|| AppError::Gateway(format!("amount out of range: {amount}")))
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_intent(
        &self,
        amount: Decimal,
        currency: &str,
        metadata: &HashMap<String, String>,
    ) -> AppResult<String> {
        let mut form = vec![
            ("amount".to_string(), to_minor_units(amount)?.to_string()),
            ("currency".to_string(), currency.to_lowercase()),
            (
                "automatic_payment_methods[enabled]".to_string(),
                "true".to_string(),
            ),
        ];
        for (key, value) in metadata {
            form.push((format!("metadata[{key}]"), value.clone()));
        }

        let intent: IntentResponse = self.post_form("payment_intents", &form).await?;
        Ok(intent.client_secret)
    }

    async fn confirm(&self, intent_id: &str) -> AppResult<bool> {
        let intent: IntentStatusResponse =
            self.get(&format!("payment_intents/{intent_id}")).await?;
        tracing::info!(intent_id, status = %intent.status, "payment intent status");
        Ok(intent.status == "succeeded")
    }

    async fn refund(&self, intent_id: &str, amount: Option<Decimal>) -> AppResult<bool> {
        let mut form = vec![("payment_intent".to_string(), intent_id.to_string())];
        if let Some(amount) = amount {
            form.push(("amount".to_string(), to_minor_units(amount)?.to_string()));
        }

        let refund: RefundResponse = self.post_form("refunds", &form).await?;
        tracing::info!(intent_id, status = %refund.status, "refund created");
        Ok(refund.status == "succeeded" || refund.status == "pending")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn amounts_convert_to_cents() {
        assert_eq!(to_minor_units(dec!(61.75)).unwrap(), 6175);
        assert_eq!(to_minor_units(dec!(10.00)).unwrap(), 1000);
        assert_eq!(to_minor_units(dec!(0.01)).unwrap(), 1);
    }
}
