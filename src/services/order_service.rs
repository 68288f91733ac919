use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::ActiveValue::Set;
use sea_orm::sea_query::{Expr, LockType};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Statement, TransactionTrait,
};
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::orders::{CreateOrderRequest, OrderList, OrderWithItems, UpdateOrderStatusRequest},
    entity::{
        cart_items::{Column as CartItemCol, Entity as CartItems},
        carts::{ActiveModel as CartActive, Column as CartCol, Entity as Carts},
        order_items::{
            ActiveModel as OrderItemActive, Column as OrderItemCol, Entity as OrderItems,
            Model as OrderItemModel,
        },
        orders::{
            ActiveModel as OrderActive, Column as OrderCol, Entity as Orders, Model as OrderModel,
        },
        payments::{
            ActiveModel as PaymentActive, Column as PaymentCol, Entity as Payments,
            Model as PaymentModel,
        },
        products::{Column as ProdCol, Entity as Products},
    },
    error::{AppError, AppResult},
    middleware::auth::{AuthUser, ensure_admin},
    models::{Order, OrderItem, OrderStatus, Payment, PaymentStatus},
    pricing::{LineAmounts, calculate_totals},
    response::{ApiResponse, Meta},
    routes::params::{OrderListQuery, SortOrder},
    state::AppState,
};

pub async fn list_orders(
    state: &AppState,
    user: &AuthUser,
    query: OrderListQuery,
) -> AppResult<ApiResponse<OrderList>> {
    let (page, limit, offset) = query.pagination.normalize();
    let mut condition = Condition::all().add(OrderCol::UserId.eq(user.user_id));
    if let Some(status) = query.status.as_ref().filter(|s| !s.is_empty()) {
        condition = condition.add(OrderCol::Status.eq(status.clone()));
    }

    let sort_order = query.sort_order.unwrap_or(SortOrder::Desc);

    let mut finder = Orders::find().filter(condition);
    finder = match sort_order {
        SortOrder::Asc => finder.order_by_asc(OrderCol::CreatedAt),
        SortOrder::Desc => finder.order_by_desc(OrderCol::CreatedAt),
    };

    let total = finder.clone().count(&state.orm).await? as i64;

    let orders = finder
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(order_from_entity)
        .collect();

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success(
        "Ok",
        OrderList { items: orders },
        Some(meta),
    ))
}

/// Checkout: convert the caller's cart into an order, its items, and a
/// payment record inside one transaction. Stock decrements, the cart clear,
/// and the order insert either all commit or all roll back.
pub async fn checkout(
    state: &AppState,
    user: &AuthUser,
    payload: CreateOrderRequest,
) -> AppResult<ApiResponse<OrderWithItems>> {
    let cart = Carts::find()
        .filter(CartCol::UserId.eq(user.user_id))
        .one(&state.orm)
        .await?
        .ok_or(AppError::EmptyCart)?;

    let txn = state.orm.begin().await?;

    let cart_items = CartItems::find()
        .filter(CartItemCol::CartId.eq(cart.id))
        .all(&txn)
        .await?;
    if cart_items.is_empty() {
        return Err(AppError::EmptyCart);
    }

    let order_number = generate_order_number(&txn).await?;
    let order_id = Uuid::new_v4();
    let now = Utc::now();

    let mut lines = Vec::with_capacity(cart_items.len());
    let mut item_actives = Vec::with_capacity(cart_items.len());
    for cart_item in &cart_items {
        let product = Products::find_by_id(cart_item.product_id)
            .lock(LockType::Update)
            .one(&txn)
            .await?
            .ok_or(AppError::ProductNotFound(cart_item.product_id))?;

        if product.stock < cart_item.quantity {
            return Err(AppError::InsufficientStock(product.name));
        }

        Products::update_many()
            .col_expr(
                ProdCol::Stock,
                Expr::col(ProdCol::Stock).sub(cart_item.quantity),
            )
            .filter(ProdCol::Id.eq(cart_item.product_id))
            .exec(&txn)
            .await?;

        lines.push(LineAmounts {
            quantity: cart_item.quantity,
            unit_price: cart_item.unit_price,
            discount: Decimal::ZERO,
        });
        // Snapshot name and price so the order survives catalog edits.
        item_actives.push(OrderItemActive {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            product_id: Set(cart_item.product_id),
            product_name: Set(product.name),
            quantity: Set(cart_item.quantity),
            unit_price: Set(cart_item.unit_price),
            discount: Set(Decimal::ZERO),
        });
    }

    let totals = calculate_totals(&lines);

    let order = OrderActive {
        id: Set(order_id),
        user_id: Set(user.user_id),
        order_number: Set(order_number.clone()),
        status: Set(OrderStatus::Pending.as_str().to_string()),
        subtotal_amount: Set(totals.subtotal),
        tax_amount: Set(totals.tax),
        shipping_amount: Set(totals.shipping),
        total_amount: Set(totals.total),
        shipping_street: Set(payload.shipping_address.street),
        shipping_city: Set(payload.shipping_address.city),
        shipping_province: Set(payload.shipping_address.province),
        shipping_postal_code: Set(payload.shipping_address.postal_code),
        shipping_country: Set(payload.shipping_address.country),
        tracking_number: Set(None),
        notes: Set(payload.notes),
        cancelled_at: Set(None),
        shipped_at: Set(None),
        delivered_at: Set(None),
        created_at: Set(now.into()),
        updated_at: Set(now.into()),
    }
    .insert(&txn)
    .await?;

    let mut items = Vec::with_capacity(item_actives.len());
    for active in item_actives {
        let item = active.insert(&txn).await?;
        items.push(order_item_from_entity(item));
    }

    // The caller supplies an already-confirmed intent, so the payment is
    // recorded as completed with the computed total.
    let payment = PaymentActive {
        id: Set(Uuid::new_v4()),
        order_id: Set(order.id),
        payment_intent_id: Set(payload.payment_intent_id),
        amount: Set(totals.total),
        currency: Set(state.config.currency.clone()),
        status: Set(PaymentStatus::Completed.as_str().to_string()),
        payment_method: Set("card".to_string()),
        failure_reason: Set(None),
        created_at: Set(now.into()),
        completed_at: Set(Some(now.into())),
    }
    .insert(&txn)
    .await?;

    // Empty the cart; the cart row itself stays.
    CartItems::delete_many()
        .filter(CartItemCol::CartId.eq(cart.id))
        .exec(&txn)
        .await?;
    let mut cart_active: CartActive = cart.into();
    cart_active.updated_at = Set(now.into());
    cart_active.update(&txn).await?;

    txn.commit().await?;

    tracing::info!(order_number, user_id = %user.user_id, "order created");

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "checkout",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order.id, "order_number": order.order_number })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Order created",
        OrderWithItems {
            order: order_from_entity(order),
            items,
            payment: Some(payment_from_entity(payment)),
        },
        Some(Meta::empty()),
    ))
}

pub async fn get_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<OrderWithItems>> {
    let order = Orders::find()
        .filter(
            Condition::all()
                .add(OrderCol::UserId.eq(user.user_id))
                .add(OrderCol::Id.eq(id)),
        )
        .one(&state.orm)
        .await?;
    let order = match order {
        Some(o) => o,
        None => return Err(AppError::NotFound),
    };

    let data = load_order_details(&state.orm, order).await?;
    Ok(ApiResponse::success("OK", data, Some(Meta::empty())))
}

pub async fn get_order_by_number(
    state: &AppState,
    user: &AuthUser,
    order_number: &str,
) -> AppResult<ApiResponse<OrderWithItems>> {
    let order = Orders::find()
        .filter(
            Condition::all()
                .add(OrderCol::UserId.eq(user.user_id))
                .add(OrderCol::OrderNumber.eq(order_number)),
        )
        .one(&state.orm)
        .await?
        .ok_or(AppError::NotFound)?;

    let data = load_order_details(&state.orm, order).await?;
    Ok(ApiResponse::success("OK", data, Some(Meta::empty())))
}

/// Cancel the caller's own order. Only legal from pending or processing;
/// restores every line item's quantity back onto product stock exactly once.
pub async fn cancel_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<OrderWithItems>> {
    let txn = state.orm.begin().await?;

    let order = Orders::find_by_id(id)
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;
    if order.user_id != user.user_id {
        return Err(AppError::Forbidden);
    }
    let current = status_of(&order);
    if current == OrderStatus::Cancelled {
        // Re-applying is normally a no-op; a user cancelling twice is an
        // error, and must not restore stock a second time.
        return Err(AppError::InvalidTransition {
            from: current,
            to: OrderStatus::Cancelled,
        });
    }

    let (order, _) = transition(&txn, order, OrderStatus::Cancelled, None).await?;
    let data = load_order_details(&txn, order).await?;

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "order_cancel",
        Some("orders"),
        Some(serde_json::json!({ "order_id": id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success("Order cancelled", data, Some(Meta::empty())))
}

/// Admin-driven status update. Funnels into [`transition`] like every other
/// caller, so timestamps and stock reversal cannot diverge by entry point.
pub async fn update_order_status(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: UpdateOrderStatusRequest,
) -> AppResult<ApiResponse<Order>> {
    ensure_admin(user)?;
    let status = OrderStatus::parse(&payload.status)
        .ok_or_else(|| AppError::BadRequest("Invalid order status".into()))?;

    let txn = state.orm.begin().await?;
    let order = Orders::find_by_id(id)
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;
    let (order, _) = transition(&txn, order, status, payload.tracking_number).await?;
    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "order_status_update",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order.id, "status": order.status })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Order updated",
        order_from_entity(order),
        Some(Meta::empty()),
    ))
}

/// Reconciler-driven status update by enum value. Also advances the payment
/// record to match, inside the same transaction. Returns the order and
/// whether anything actually changed (re-applying the current status is a
/// no-op, so at-least-once event delivery cannot double-apply side effects).
pub async fn set_order_status(
    state: &AppState,
    order_id: Uuid,
    status: OrderStatus,
) -> AppResult<(Order, bool)> {
    let txn = state.orm.begin().await?;
    let order = Orders::find_by_id(order_id)
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;
    let (order, changed) = transition(&txn, order, status, None).await?;
    if changed {
        sync_payment(&txn, order.id, status).await?;
    }
    txn.commit().await?;
    Ok((order_from_entity(order), changed))
}

/// The single status transition function. Validates the edge, applies the
/// status-specific side effects, and persists the order as one write within
/// the caller's transaction.
pub async fn transition<C: ConnectionTrait>(
    conn: &C,
    order: OrderModel,
    new_status: OrderStatus,
    tracking_number: Option<String>,
) -> AppResult<(OrderModel, bool)> {
    let current = status_of(&order);
    if current == new_status {
        return Ok((order, false));
    }
    if !current.can_transition_to(new_status) {
        return Err(AppError::InvalidTransition {
            from: current,
            to: new_status,
        });
    }

    let now = Utc::now();
    let order_id = order.id;
    let mut active: OrderActive = order.into();
    active.status = Set(new_status.as_str().to_string());
    active.updated_at = Set(now.into());

    match new_status {
        OrderStatus::Cancelled => {
            // Stock reversal: each snapshot quantity goes back onto the
            // product it came from.
            let items = OrderItems::find()
                .filter(OrderItemCol::OrderId.eq(order_id))
                .all(conn)
                .await?;
            for item in items {
                Products::update_many()
                    .col_expr(ProdCol::Stock, Expr::col(ProdCol::Stock).add(item.quantity))
                    .filter(ProdCol::Id.eq(item.product_id))
                    .exec(conn)
                    .await?;
            }
            active.cancelled_at = Set(Some(now.into()));
        }
        OrderStatus::Shipped => {
            active.shipped_at = Set(Some(now.into()));
            if let Some(tracking) = tracking_number.filter(|t| !t.trim().is_empty()) {
                active.tracking_number = Set(Some(tracking));
            }
        }
        OrderStatus::Delivered => {
            active.delivered_at = Set(Some(now.into()));
        }
        // Processing and Refunded are status updates only. A refund is a
        // financial event, not a restocking event.
        _ => {}
    }

    let updated = active.update(conn).await?;
    tracing::info!(order_id = %updated.id, status = %new_status, "order status updated");
    Ok((updated, true))
}

async fn sync_payment<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    status: OrderStatus,
) -> AppResult<()> {
    let Some(payment) = Payments::find()
        .filter(PaymentCol::OrderId.eq(order_id))
        .one(conn)
        .await?
    else {
        return Ok(());
    };

    let completed_at = payment.completed_at;
    let mut active: PaymentActive = payment.into();
    match status {
        OrderStatus::Processing => {
            active.status = Set(PaymentStatus::Completed.as_str().to_string());
            if completed_at.is_none() {
                active.completed_at = Set(Some(Utc::now().into()));
            }
        }
        OrderStatus::Cancelled => {
            active.status = Set(PaymentStatus::Failed.as_str().to_string());
            active.failure_reason = Set(Some("payment failed".to_string()));
        }
        OrderStatus::Refunded => {
            active.status = Set(PaymentStatus::Refunded.as_str().to_string());
        }
        _ => return Ok(()),
    }
    active.update(conn).await?;
    Ok(())
}

/// Next order number for today, computed inside the caller's transaction.
/// The upsert takes the counter row's lock and increments the latest
/// committed value, not a statement snapshot, so concurrent checkouts
/// serialize on the counter and suffixes come out sequential with no
/// duplicates. The first order of the day creates the row. The unique
/// constraint on order_number stays as a backstop.
async fn generate_order_number<C: ConnectionTrait>(conn: &C) -> AppResult<String> {
    let today = Utc::now().date_naive();
    let stmt = Statement::from_sql_and_values(
        conn.get_database_backend(),
        r#"
        INSERT INTO order_counters (day, last_number)
        VALUES ($1, 1)
        ON CONFLICT (day) DO UPDATE SET last_number = order_counters.last_number + 1
        RETURNING last_number
        "#,
        [today.into()],
    );
    let row = conn.query_one(stmt).await?.ok_or_else(|| {
        AppError::Internal(anyhow::anyhow!("order counter upsert returned no row"))
    })?;
    let suffix: i32 = row.try_get("", "last_number")?;
    Ok(format_order_number(today, suffix))
}

fn format_order_number(day: NaiveDate, suffix: i32) -> String {
    format!("ORD-{}-{suffix:04}", day.format("%Y%m%d"))
}

pub(crate) async fn load_order_details<C: ConnectionTrait>(
    conn: &C,
    order: OrderModel,
) -> AppResult<OrderWithItems> {
    let items = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order.id))
        .all(conn)
        .await?
        .into_iter()
        .map(order_item_from_entity)
        .collect();

    let payment = Payments::find()
        .filter(PaymentCol::OrderId.eq(order.id))
        .one(conn)
        .await?
        .map(payment_from_entity);

    Ok(OrderWithItems {
        order: order_from_entity(order),
        items,
        payment,
    })
}

fn status_of(order: &OrderModel) -> OrderStatus {
    OrderStatus::parse(&order.status).unwrap_or(OrderStatus::Pending)
}

pub(crate) fn order_from_entity(model: OrderModel) -> Order {
    let status = OrderStatus::parse(&model.status).unwrap_or(OrderStatus::Pending);
    Order {
        id: model.id,
        user_id: model.user_id,
        order_number: model.order_number,
        status,
        subtotal_amount: model.subtotal_amount,
        tax_amount: model.tax_amount,
        shipping_amount: model.shipping_amount,
        total_amount: model.total_amount,
        shipping_street: model.shipping_street,
        shipping_city: model.shipping_city,
        shipping_province: model.shipping_province,
        shipping_postal_code: model.shipping_postal_code,
        shipping_country: model.shipping_country,
        tracking_number: model.tracking_number,
        notes: model.notes,
        cancelled_at: model.cancelled_at.map(|dt| dt.with_timezone(&Utc)),
        shipped_at: model.shipped_at.map(|dt| dt.with_timezone(&Utc)),
        delivered_at: model.delivered_at.map(|dt| dt.with_timezone(&Utc)),
        created_at: model.created_at.with_timezone(&Utc),
        updated_at: model.updated_at.with_timezone(&Utc),
    }
}

fn order_item_from_entity(model: OrderItemModel) -> OrderItem {
    let subtotal = Decimal::from(model.quantity) * model.unit_price - model.discount;
    OrderItem {
        id: model.id,
        order_id: model.order_id,
        product_id: model.product_id,
        product_name: model.product_name,
        quantity: model.quantity,
        unit_price: model.unit_price,
        discount: model.discount,
        subtotal,
    }
}

fn payment_from_entity(model: PaymentModel) -> Payment {
    let status = match model.status.as_str() {
        "completed" => PaymentStatus::Completed,
        "failed" => PaymentStatus::Failed,
        "refunded" => PaymentStatus::Refunded,
        _ => PaymentStatus::Pending,
    };
    Payment {
        id: model.id,
        order_id: model.order_id,
        payment_intent_id: model.payment_intent_id,
        amount: model.amount,
        currency: model.currency,
        status,
        payment_method: model.payment_method,
        failure_reason: model.failure_reason,
        created_at: model.created_at.with_timezone(&Utc),
        completed_at: model.completed_at.map(|dt| dt.with_timezone(&Utc)),
    }
}

#[cfg(test)]
mod tests {
    use super::format_order_number;
    use chrono::NaiveDate;

    #[test]
    fn order_numbers_carry_date_prefix_and_padded_suffix() {
        let day = NaiveDate::from_ymd_opt(2026, 8, 27).unwrap();
        assert_eq!(format_order_number(day, 1), "ORD-20260827-0001");
        assert_eq!(format_order_number(day, 42), "ORD-20260827-0042");
        assert_eq!(format_order_number(day, 999), "ORD-20260827-0999");
    }

    #[test]
    fn suffix_padding_widens_past_four_digits() {
        let day = NaiveDate::from_ymd_opt(2026, 8, 27).unwrap();
        assert_eq!(format_order_number(day, 1000), "ORD-20260827-1000");
        assert_eq!(format_order_number(day, 10000), "ORD-20260827-10000");
    }
}
