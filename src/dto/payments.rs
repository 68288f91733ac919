use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateIntentRequest {
    pub amount: Decimal,
    pub currency: Option<String>,
    pub metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PaymentIntentResponse {
    pub client_secret: String,
    pub amount: Decimal,
    pub currency: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ConfirmPaymentRequest {
    pub payment_intent_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PaymentResultResponse {
    pub success: bool,
    pub payment_intent_id: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RefundRequest {
    pub payment_intent_id: String,
    /// Omit for a full refund.
    pub amount: Option<Decimal>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RefundResponse {
    pub success: bool,
    pub payment_intent_id: String,
    pub refund_amount: Option<Decimal>,
}
