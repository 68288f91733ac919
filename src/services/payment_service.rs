use crate::{
    audit::log_audit,
    dto::payments::{
        ConfirmPaymentRequest, CreateIntentRequest, PaymentIntentResponse, PaymentResultResponse,
        RefundRequest, RefundResponse,
    },
    error::AppResult,
    middleware::auth::{AuthUser, ensure_admin},
    response::{ApiResponse, Meta},
    state::AppState,
};

pub async fn create_intent(
    state: &AppState,
    user: &AuthUser,
    payload: CreateIntentRequest,
) -> AppResult<ApiResponse<PaymentIntentResponse>> {
    let currency = payload
        .currency
        .unwrap_or_else(|| state.config.currency.clone());
    let mut metadata = payload.metadata.unwrap_or_default();
    metadata
        .entry("user_id".to_string())
        .or_insert_with(|| user.user_id.to_string());

    let client_secret = state
        .gateway
        .create_intent(payload.amount, &currency, &metadata)
        .await?;

    tracing::info!(amount = %payload.amount, %currency, "payment intent created");

    Ok(ApiResponse::success(
        "Payment intent created",
        PaymentIntentResponse {
            client_secret,
            amount: payload.amount,
            currency,
        },
        Some(Meta::empty()),
    ))
}

pub async fn confirm_payment(
    state: &AppState,
    _user: &AuthUser,
    payload: ConfirmPaymentRequest,
) -> AppResult<ApiResponse<PaymentResultResponse>> {
    let success = state.gateway.confirm(&payload.payment_intent_id).await?;

    tracing::info!(
        payment_intent_id = %payload.payment_intent_id,
        success,
        "payment confirmation checked"
    );

    Ok(ApiResponse::success(
        "Payment confirmation",
        PaymentResultResponse {
            success,
            payment_intent_id: payload.payment_intent_id,
        },
        Some(Meta::empty()),
    ))
}

pub async fn refund_payment(
    state: &AppState,
    user: &AuthUser,
    payload: RefundRequest,
) -> AppResult<ApiResponse<RefundResponse>> {
    ensure_admin(user)?;

    let success = state
        .gateway
        .refund(&payload.payment_intent_id, payload.amount)
        .await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "payment_refund",
        Some("payments"),
        Some(serde_json::json!({
            "payment_intent_id": payload.payment_intent_id,
            "amount": payload.amount,
        })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Refund processed",
        RefundResponse {
            success,
            payment_intent_id: payload.payment_intent_id,
            refund_amount: payload.amount,
        },
        Some(Meta::empty()),
    ))
}
