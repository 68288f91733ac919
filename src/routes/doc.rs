use utoipa::{
    Modify, OpenApi,
    openapi::{
        self,
        OpenApi as OpenApiSpec,
        security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    },
};
use utoipa_scalar::{Scalar, Servable};

use crate::{
    dto::{
        cart::{AddToCartRequest, CartItemDto, CartList, UpdateCartItemRequest},
        orders::{
            CreateOrderRequest, OrderList, OrderWithItems, ShippingAddress,
            UpdateOrderStatusRequest,
        },
        payments::{
            ConfirmPaymentRequest, CreateIntentRequest, PaymentIntentResponse,
            PaymentResultResponse, RefundRequest, RefundResponse,
        },
        products::ProductList,
    },
    models::{CartItem, Order, OrderItem, Payment, Product},
    response::{ApiResponse, Meta},
    routes::{admin, cart, health, orders, params, payments, products as product_routes, webhooks},
};

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health_check,
        product_routes::list_products,
        product_routes::get_product,
        cart::cart_list,
        cart::add_to_cart,
        cart::update_cart_item,
        cart::remove_from_cart,
        orders::list_orders,
        orders::create_order,
        orders::get_order,
        orders::get_order_by_number,
        orders::cancel_order,
        payments::create_intent,
        payments::confirm_payment,
        payments::refund_payment,
        admin::list_all_orders,
        admin::get_order_admin,
        admin::update_order_status,
        admin::list_low_stock,
        webhooks::stripe_webhook
    ),
    components(
        schemas(
            Product,
            CartItem,
            Order,
            OrderItem,
            Payment,
            ShippingAddress,
            CreateOrderRequest,
            UpdateOrderStatusRequest,
            AddToCartRequest,
            UpdateCartItemRequest,
            CreateIntentRequest,
            ConfirmPaymentRequest,
            RefundRequest,
            PaymentIntentResponse,
            PaymentResultResponse,
            RefundResponse,
            CartItemDto,
            CartList,
            OrderList,
            OrderWithItems,
            ProductList,
            admin::LowStockQuery,
            params::Pagination,
            params::ProductQuery,
            params::OrderListQuery,
            Meta,
            ApiResponse<Product>,
            ApiResponse<ProductList>,
            ApiResponse<CartList>,
            ApiResponse<OrderWithItems>,
            ApiResponse<OrderList>
        )
    ),
    security(
        ("bearer_auth" = [])
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check endpoint"),
        (name = "Products", description = "Product catalog endpoints"),
        (name = "Cart", description = "Cart endpoints"),
        (name = "Orders", description = "Order lifecycle endpoints"),
        (name = "Payments", description = "Payment gateway endpoints"),
        (name = "Admin", description = "Admin endpoints"),
        (name = "Webhooks", description = "Gateway webhook endpoints"),
    )
)]
pub struct ApiDoc;

pub fn scalar_docs() -> Scalar<OpenApiSpec> {
    Scalar::with_url("/docs", ApiDoc::openapi())
}
