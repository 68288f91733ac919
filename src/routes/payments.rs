use axum::{Json, Router, extract::State, routing::post};

use crate::{
    dto::payments::{
        ConfirmPaymentRequest, CreateIntentRequest, PaymentIntentResponse, PaymentResultResponse,
        RefundRequest, RefundResponse,
    },
    error::AppResult,
    middleware::auth::AuthUser,
    response::ApiResponse,
    services::payment_service,
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/intent", post(create_intent))
        .route("/confirm", post(confirm_payment))
        .route("/refund", post(refund_payment))
}

#[utoipa::path(
    post,
    path = "/payments/intent",
    request_body = CreateIntentRequest,
    responses(
        (status = 200, description = "Create a payment intent", body = ApiResponse<PaymentIntentResponse>),
        (status = 502, description = "Gateway error"),
    ),
    security(("bearer_auth" = [])),
    tag = "Payments"
)]
pub async fn create_intent(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CreateIntentRequest>,
) -> AppResult<Json<ApiResponse<PaymentIntentResponse>>> {
    let resp = payment_service::create_intent(&state, &user, payload).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    post,
    path = "/payments/confirm",
    request_body = ConfirmPaymentRequest,
    responses(
        (status = 200, description = "Check a payment intent status", body = ApiResponse<PaymentResultResponse>),
        (status = 502, description = "Gateway error"),
    ),
    security(("bearer_auth" = [])),
    tag = "Payments"
)]
pub async fn confirm_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<ConfirmPaymentRequest>,
) -> AppResult<Json<ApiResponse<PaymentResultResponse>>> {
    let resp = payment_service::confirm_payment(&state, &user, payload).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    post,
    path = "/payments/refund",
    request_body = RefundRequest,
    responses(
        (status = 200, description = "Refund a payment", body = ApiResponse<RefundResponse>),
        (status = 403, description = "Admin only"),
        (status = 502, description = "Gateway error"),
    ),
    security(("bearer_auth" = [])),
    tag = "Payments"
)]
pub async fn refund_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<RefundRequest>,
) -> AppResult<Json<ApiResponse<RefundResponse>>> {
    let resp = payment_service::refund_payment(&state, &user, payload).await?;
    Ok(Json(resp))
}
