use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum_storefront_api::{
    config::AppConfig,
    db::{create_orm_conn, create_pool, run_migrations},
    dto::{
        cart::AddToCartRequest,
        orders::{CreateOrderRequest, ShippingAddress, UpdateOrderStatusRequest},
    },
    entity::{
        payments::Entity as Payments, products::ActiveModel as ProductActive,
        products::Entity as Products, users::ActiveModel as UserActive,
    },
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    models::{OrderStatus, PaymentStatus},
    notify::{LogNotifier, NotificationDispatcher},
    payments::PaymentGateway,
    routes::admin::LowStockQuery,
    routes::params::Pagination,
    services::{admin_service, cart_service, order_service, webhook_service},
    state::AppState,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sha2::Sha256;
use sea_orm::ActiveValue::NotSet;
use sea_orm::{ActiveModelTrait, ConnectionTrait, EntityTrait, Set, Statement};
use uuid::Uuid;

struct FakeGateway;

#[async_trait::async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_intent(
        &self,
        _amount: Decimal,
        _currency: &str,
        _metadata: &HashMap<String, String>,
    ) -> AppResult<String> {
        Ok("pi_test_secret".into())
    }

    async fn confirm(&self, _payment_intent_id: &str) -> AppResult<bool> {
        Ok(true)
    }

    async fn refund(&self, _payment_intent_id: &str, _amount: Option<Decimal>) -> AppResult<bool> {
        Ok(true)
    }
}

#[derive(Default)]
struct RecordingNotifier {
    confirmations: Mutex<Vec<String>>,
    refunds: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl NotificationDispatcher for RecordingNotifier {
    async fn send_order_confirmation(&self, email: &str, order_number: &str, _total: Decimal) {
        self.confirmations
            .lock()
            .unwrap()
            .push(format!("{email}:{order_number}"));
    }

    async fn send_refund_confirmation(&self, email: &str, order_number: &str, _amount: Decimal) {
        self.refunds
            .lock()
            .unwrap()
            .push(format!("{email}:{order_number}"));
    }
}

const WEBHOOK_SECRET: &str = "whsec_test";

fn signed_header(payload: &[u8], secret: &str) -> String {
    let ts = Utc::now().timestamp();
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(ts.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    format!("t={ts},v1={}", hex::encode(mac.finalize().into_bytes()))
}

// Integration flow: user adds to cart -> checkout -> cancel; admin moves a
// second order through the lifecycle and sees low stock.
#[tokio::test]
async fn checkout_cancel_and_admin_flow() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let user_id = create_user(&state, "user", "user@example.com").await?;
    let admin_id = create_user(&state, "admin", "admin@example.com").await?;

    let product = ProductActive {
        id: Set(Uuid::new_v4()),
        name: Set("Test Widget".into()),
        description: Set(Some("A product for testing".into())),
        price: Set(dec!(15.00)),
        stock: Set(10),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;

    let auth_user = AuthUser {
        user_id,
        role: "user".into(),
    };
    let auth_admin = AuthUser {
        user_id: admin_id,
        role: "admin".into(),
    };

    cart_service::add_to_cart(
        &state,
        &auth_user,
        AddToCartRequest {
            product_id: product.id,
            quantity: 3,
        },
    )
    .await?;

    // Checkout: 3 x 15.00 = 45.00 subtotal, 15% tax = 6.75, flat 10.00
    // shipping, 61.75 total.
    let checkout_resp = order_service::checkout(
        &state,
        &auth_user,
        create_order_request("pi_first"),
    )
    .await?;
    let data = checkout_resp.data.unwrap();
    let order = data.order;
    assert_eq!(order.subtotal_amount, dec!(45.00));
    assert_eq!(order.tax_amount, dec!(6.75));
    assert_eq!(order.shipping_amount, dec!(10.00));
    assert_eq!(order.total_amount, dec!(61.75));
    assert_eq!(order.status, OrderStatus::Pending);
    assert!(order.order_number.starts_with("ORD-"));
    assert!(order.order_number.ends_with("-0001"));
    assert_eq!(data.items.len(), 1);

    let payment = data.payment.expect("payment recorded at checkout");
    assert_eq!(payment.amount, dec!(61.75));
    assert_eq!(payment.status, PaymentStatus::Completed);

    // Stock decremented and cart emptied.
    let on_shelf = Products::find_by_id(product.id)
        .one(&state.orm)
        .await?
        .unwrap();
    assert_eq!(on_shelf.stock, 7);

    let err = order_service::checkout(&state, &auth_user, create_order_request("pi_again"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::EmptyCart));

    // Second checkout gets the next sequential number.
    cart_service::add_to_cart(
        &state,
        &auth_user,
        AddToCartRequest {
            product_id: product.id,
            quantity: 2,
        },
    )
    .await?;
    let second = order_service::checkout(&state, &auth_user, create_order_request("pi_second"))
        .await?
        .data
        .unwrap()
        .order;
    assert!(second.order_number.ends_with("-0002"));

    // Cancel the first order: stock restored exactly once.
    let cancelled = order_service::cancel_order(&state, &auth_user, order.id)
        .await?
        .data
        .unwrap()
        .order;
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert!(cancelled.cancelled_at.is_some());

    let on_shelf = Products::find_by_id(product.id)
        .one(&state.orm)
        .await?
        .unwrap();
    assert_eq!(on_shelf.stock, 8);

    let err = order_service::cancel_order(&state, &auth_user, order.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition { .. }));

    let on_shelf = Products::find_by_id(product.id)
        .one(&state.orm)
        .await?
        .unwrap();
    assert_eq!(on_shelf.stock, 8, "double cancel must not restore stock again");

    // Admin walks the second order through the lifecycle.
    let updated = order_service::update_order_status(
        &state,
        &auth_admin,
        second.id,
        UpdateOrderStatusRequest {
            status: "processing".into(),
            tracking_number: None,
        },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(updated.status, OrderStatus::Processing);

    let updated = order_service::update_order_status(
        &state,
        &auth_admin,
        second.id,
        UpdateOrderStatusRequest {
            status: "shipped".into(),
            tracking_number: Some("TRK123".into()),
        },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(updated.status, OrderStatus::Shipped);
    assert_eq!(updated.tracking_number.as_deref(), Some("TRK123"));
    assert!(updated.shipped_at.is_some());

    // Shipped orders can no longer be cancelled.
    let err = order_service::update_order_status(
        &state,
        &auth_admin,
        second.id,
        UpdateOrderStatusRequest {
            status: "cancelled".into(),
            tracking_number: None,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition { .. }));

    // Low stock includes the product after the net decrement to 8.
    let low = admin_service::list_low_stock(
        &state,
        &auth_admin,
        LowStockQuery {
            pagination: Pagination {
                page: Some(1),
                per_page: Some(20),
            },
            threshold: Some(10),
        },
    )
    .await?;
    assert!(
        low.data.unwrap().items.iter().any(|p| p.id == product.id),
        "expected product to appear in low-stock list"
    );

    Ok(())
}

#[tokio::test]
async fn checkout_rolls_back_when_stock_is_short() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let user_id = create_user(&state, "user", "rollback@example.com").await?;
    let auth_user = AuthUser {
        user_id,
        role: "user".into(),
    };

    let plentiful = ProductActive {
        id: Set(Uuid::new_v4()),
        name: Set("Plentiful".into()),
        description: Set(None),
        price: Set(dec!(5.00)),
        stock: Set(50),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;
    let scarce = ProductActive {
        id: Set(Uuid::new_v4()),
        name: Set("Scarce".into()),
        description: Set(None),
        price: Set(dec!(9.00)),
        stock: Set(2),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;

    for (product_id, quantity) in [(plentiful.id, 4), (scarce.id, 5)] {
        cart_service::add_to_cart(
            &state,
            &auth_user,
            AddToCartRequest {
                product_id,
                quantity,
            },
        )
        .await?;
    }

    let err = order_service::checkout(&state, &auth_user, create_order_request("pi_short"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InsufficientStock(_)));

    // All or nothing: the in-stock line's decrement is rolled back too and
    // the cart is untouched.
    let plentiful_after = Products::find_by_id(plentiful.id)
        .one(&state.orm)
        .await?
        .unwrap();
    assert_eq!(plentiful_after.stock, 50);
    let scarce_after = Products::find_by_id(scarce.id)
        .one(&state.orm)
        .await?
        .unwrap();
    assert_eq!(scarce_after.stock, 2);

    let cart = cart_service::list_cart(&state, &auth_user).await?;
    assert_eq!(cart.data.unwrap().items.len(), 2);

    Ok(())
}

// Reconciliation entry point used by the webhook handler: re-applying the
// same status reports no change, refunds sync the payment record.
#[tokio::test]
async fn set_order_status_is_idempotent_and_syncs_payment() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let user_id = create_user(&state, "user", "webhook@example.com").await?;
    let auth_user = AuthUser {
        user_id,
        role: "user".into(),
    };

    let product = ProductActive {
        id: Set(Uuid::new_v4()),
        name: Set("Reconciled".into()),
        description: Set(None),
        price: Set(dec!(20.00)),
        stock: Set(10),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;

    cart_service::add_to_cart(
        &state,
        &auth_user,
        AddToCartRequest {
            product_id: product.id,
            quantity: 1,
        },
    )
    .await?;
    let order = order_service::checkout(&state, &auth_user, create_order_request("pi_hook"))
        .await?
        .data
        .unwrap()
        .order;

    let (_, changed) =
        order_service::set_order_status(&state, order.id, OrderStatus::Processing).await?;
    assert!(changed);
    let (_, changed) =
        order_service::set_order_status(&state, order.id, OrderStatus::Processing).await?;
    assert!(!changed, "re-delivered event must be a no-op");

    let (_, changed) =
        order_service::set_order_status(&state, order.id, OrderStatus::Refunded).await?;
    assert!(changed);

    let payment = Payments::find()
        .all(&state.orm)
        .await?
        .into_iter()
        .find(|p| p.order_id == order.id)
        .expect("payment row");
    assert_eq!(payment.status, "refunded");

    Ok(())
}

// Same signed event delivered twice: one notification, second delivery
// acknowledged but skipped by the event-id ledger.
#[tokio::test]
async fn duplicate_webhook_delivery_sends_one_notification() -> anyhow::Result<()> {
    let Some(mut state) = setup_state().await? else {
        return Ok(());
    };
    let recorder = Arc::new(RecordingNotifier::default());
    state.notifier = recorder.clone();

    let user_id = create_user(&state, "user", "dup@example.com").await?;
    let auth_user = AuthUser {
        user_id,
        role: "user".into(),
    };

    let product = ProductActive {
        id: Set(Uuid::new_v4()),
        name: Set("Duplicated".into()),
        description: Set(None),
        price: Set(dec!(12.00)),
        stock: Set(10),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;

    cart_service::add_to_cart(
        &state,
        &auth_user,
        AddToCartRequest {
            product_id: product.id,
            quantity: 1,
        },
    )
    .await?;
    let order = order_service::checkout(&state, &auth_user, create_order_request("pi_dup"))
        .await?
        .data
        .unwrap()
        .order;

    let payload = format!(
        r#"{{"id":"evt_dup_1","type":"payment_intent.succeeded","data":{{"object":{{"id":"pi_dup","metadata":{{"order_id":"{}","user_email":"dup@example.com"}}}}}}}}"#,
        order.id
    );

    // A tampered signature is rejected before any state is touched.
    let bad_header = signed_header(payload.as_bytes(), "whsec_wrong");
    let err = webhook_service::handle_gateway_event(&state, payload.as_bytes(), &bad_header)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Unauthorized(_)));
    assert!(recorder.confirmations.lock().unwrap().is_empty());

    let header = signed_header(payload.as_bytes(), WEBHOOK_SECRET);
    webhook_service::handle_gateway_event(&state, payload.as_bytes(), &header).await?;
    // Redelivery of the identical event must still be acknowledged.
    webhook_service::handle_gateway_event(&state, payload.as_bytes(), &header).await?;

    let confirmations = recorder.confirmations.lock().unwrap().clone();
    assert_eq!(
        confirmations,
        vec![format!("dup@example.com:{}", order.order_number)]
    );
    assert!(recorder.refunds.lock().unwrap().is_empty());

    let after = order_service::get_order(&state, &auth_user, order.id)
        .await?
        .data
        .unwrap()
        .order;
    assert_eq!(after.status, OrderStatus::Processing);

    Ok(())
}

fn create_order_request(payment_intent_id: &str) -> CreateOrderRequest {
    CreateOrderRequest {
        shipping_address: ShippingAddress {
            street: "123 Main St".into(),
            city: "Halifax".into(),
            province: "NS".into(),
            postal_code: "B3H 1A1".into(),
            country: "CA".into(),
        },
        notes: None,
        payment_intent_id: payment_intent_id.into(),
    }
}

// Allow skipping when no DB is configured in the environment.
async fn setup_state() -> anyhow::Result<Option<AppState>> {
    let database_url =
        match std::env::var("TEST_DATABASE_URL").or_else(|_| std::env::var("DATABASE_URL")) {
            Ok(url) => url,
            Err(_) => {
                eprintln!(
                    "Skipping test: set TEST_DATABASE_URL or DATABASE_URL to run integration flow tests."
                );
                return Ok(None);
            }
        };

    let pool = create_pool(&database_url).await?;
    let orm = create_orm_conn(&database_url).await?;
    run_migrations(&orm).await?;

    // Clean tables between runs
    let backend = orm.get_database_backend();
    orm.execute(Statement::from_string(
        backend,
        "TRUNCATE TABLE order_items, payments, orders, order_counters, cart_items, carts, webhook_events, audit_logs, products, users RESTART IDENTITY CASCADE",
    ))
    .await?;

    let config = AppConfig {
        database_url,
        host: "127.0.0.1".into(),
        port: 0,
        stripe_secret_key: "sk_test".into(),
        stripe_webhook_secret: WEBHOOK_SECRET.into(),
        currency: "CAD".into(),
    };

    Ok(Some(AppState {
        pool,
        orm,
        config,
        gateway: Arc::new(FakeGateway),
        notifier: Arc::new(LogNotifier),
    }))
}

async fn create_user(state: &AppState, role: &str, email: &str) -> anyhow::Result<Uuid> {
    let user = UserActive {
        id: Set(Uuid::new_v4()),
        email: Set(email.to_string()),
        role: Set(role.into()),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;

    Ok(user.id)
}
