//! Shopping cart entity.
//!
//! One cart per entity ID. Items keep the order in which their product was
//! first added; adding an existing product increases its quantity.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::EntityConfig;
use crate::entity::{Behavior, Effect, EntityContext, EventSourcedEntity};

/// Service name the cart is registered under.
pub const SERVICE_NAME: &str = "com.example.shoppingcart.ShoppingCart";

/// Groups the event logs of all carts.
pub const PERSISTENCE_ID: &str = "shopping-cart";

/// Registration for the cart: snapshot every 5 events, schema files from the
/// crate's `proto/` directory, JSON persistence.
pub fn config() -> EntityConfig {
    EntityConfig::new(PERSISTENCE_ID)
        .snapshot_every(5)
        .include_dirs([Path::new(env!("CARGO_MANIFEST_DIR")).join("proto")])
        .descriptor("shoppingcart.proto")
        .descriptor("domain.proto")
        .serialize_fallback_to_json(true)
}

/// One product line in a cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub product_id: String,
    pub name: String,
    pub quantity: i32,
}

/// Cart state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    /// In first-insertion order.
    pub items: Vec<LineItem>,
}

impl Cart {
    pub fn item(&self, product_id: &str) -> Option<&LineItem> {
        self.items.iter().find(|item| item.product_id == product_id)
    }

    pub fn quantity_of(&self, product_id: &str) -> i32 {
        self.item(product_id).map_or(0, |item| item.quantity)
    }
}

/// Commands accepted by the cart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum CartCommand {
    AddItem {
        product_id: String,
        name: String,
        quantity: i32,
    },
    RemoveItem {
        product_id: String,
    },
    GetCart,
}

/// Events emitted by the cart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum CartEvent {
    ItemAdded {
        product_id: String,
        name: String,
        quantity: i32,
    },
    ItemRemoved {
        product_id: String,
    },
}

/// Replies to cart commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CartReply {
    /// Acknowledges a state-changing command.
    Empty,
    /// A copy of the cart.
    Cart(Cart),
}

/// Reasons a cart command is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CartError {
    #[error("Cannot add negative quantity to item {product_id}")]
    NegativeQuantity { product_id: String },
    #[error("Item {product_id} not in cart")]
    NotInCart { product_id: String },
    #[error("Cannot add {quantity} to item {product_id}: quantity would exceed {max}", max = i32::MAX)]
    QuantityOverflow { product_id: String, quantity: i32 },
}

/// Marker type implementing the cart's [`EventSourcedEntity`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ShoppingCart;

impl EventSourcedEntity for ShoppingCart {
    const ENTITY_TYPE: &'static str = "shopping-cart";

    type State = Cart;
    type Command = CartCommand;
    type Event = CartEvent;
    type Reply = CartReply;
    type Rejection = CartError;

    fn initial_state(_entity_id: &str) -> Cart {
        Cart::default()
    }

    // A cart has no lifecycle stages, so every state uses the same handlers.
    fn behavior(_cart: &Cart) -> Behavior<Self> {
        Behavior::new("open", handle_command, handle_event)
    }
}

fn handle_command(
    ctx: &EntityContext<'_>,
    cart: &Cart,
    cmd: CartCommand,
) -> Effect<ShoppingCart> {
    match cmd {
        CartCommand::AddItem {
            product_id,
            name,
            quantity,
        } => add_item(ctx, cart, product_id, name, quantity),
        CartCommand::RemoveItem { product_id } => remove_item(ctx, cart, product_id),
        CartCommand::GetCart => get_cart(cart),
    }
}

fn add_item(
    ctx: &EntityContext<'_>,
    cart: &Cart,
    product_id: String,
    name: String,
    quantity: i32,
) -> Effect<ShoppingCart> {
    if quantity < 1 {
        tracing::debug!(entity_id = ctx.entity_id, %product_id, quantity, "add rejected");
        return Effect::fail(CartError::NegativeQuantity { product_id });
    }
    if cart.quantity_of(&product_id).checked_add(quantity).is_none() {
        tracing::debug!(entity_id = ctx.entity_id, %product_id, quantity, "add would overflow");
        return Effect::fail(CartError::QuantityOverflow {
            product_id,
            quantity,
        });
    }
    Effect::emit(
        CartEvent::ItemAdded {
            product_id,
            name,
            quantity,
        },
        CartReply::Empty,
    )
}

fn remove_item(ctx: &EntityContext<'_>, cart: &Cart, product_id: String) -> Effect<ShoppingCart> {
    if cart.item(&product_id).is_none() {
        tracing::debug!(entity_id = ctx.entity_id, %product_id, "remove rejected");
        return Effect::fail(CartError::NotInCart { product_id });
    }
    Effect::emit(CartEvent::ItemRemoved { product_id }, CartReply::Empty)
}

fn get_cart(cart: &Cart) -> Effect<ShoppingCart> {
    Effect::reply(CartReply::Cart(cart.clone()))
}

fn handle_event(cart: Cart, event: &CartEvent) -> Cart {
    match event {
        CartEvent::ItemAdded {
            product_id,
            name,
            quantity,
        } => item_added(cart, product_id, name, *quantity),
        CartEvent::ItemRemoved { product_id } => item_removed(cart, product_id),
    }
}

fn item_added(mut cart: Cart, product_id: &str, name: &str, quantity: i32) -> Cart {
    match cart
        .items
        .iter_mut()
        .find(|item| item.product_id == product_id)
    {
        // Saturating so that replaying any stored history stays total.
        Some(existing) => existing.quantity = existing.quantity.saturating_add(quantity),
        None => cart.items.push(LineItem {
            product_id: product_id.to_owned(),
            name: name.to_owned(),
            quantity,
        }),
    }
    cart
}

// Absent items are fine: the event already happened and must always apply.
fn item_removed(mut cart: Cart, product_id: &str) -> Cart {
    cart.items.retain(|item| item.product_id != product_id);
    cart
}
