//! Walks a shopping cart through a few commands, then passivates it and
//! recovers it from disk.
//!
//! ```text
//! RUST_LOG=entityfold=debug cargo run --example shopping_cart [DATA_DIR]
//! ```

use std::error::Error;
use std::path::PathBuf;

use entityfold::shopping_cart::{self, CartCommand, CartReply, ShoppingCart};
use entityfold::{CommandContext, CommandEnvelope, EntityStore, StorageLayout};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let data_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("entityfold-demo"));

    let store = EntityStore::builder()
        .base_dir(&data_dir)
        .register::<ShoppingCart>(shopping_cart::SERVICE_NAME, shopping_cart::config())
        .open()?;

    for reg in store.registrations() {
        tracing::info!(
            service = %reg.service_name,
            descriptors = ?reg.descriptors,
            "serving"
        );
    }

    let ctx = CommandContext::default().with_actor("demo");
    let cart = store.get::<ShoppingCart>("alice").await?;

    cart.send(
        CartCommand::AddItem {
            product_id: "apple".into(),
            name: "Apple".into(),
            quantity: 3,
        },
        ctx.clone(),
    )
    .await?;
    cart.send(
        CartCommand::AddItem {
            product_id: "pear".into(),
            name: "Pear".into(),
            quantity: 1,
        },
        ctx.clone(),
    )
    .await?;

    let rejected = cart
        .send(
            CartCommand::AddItem {
                product_id: "apple".into(),
                name: "Apple".into(),
                quantity: -2,
            },
            ctx.clone(),
        )
        .await;
    if let Err(e) = rejected {
        println!("rejected: {e}");
    }

    // The same entity, addressed the way a remote caller would.
    let reply = store
        .dispatch(
            CommandEnvelope::new(
                shopping_cart::SERVICE_NAME,
                "alice",
                json!({"type": "RemoveItem", "data": {"productId": "pear"}}),
            )
            .with_context(ctx.clone()),
        )
        .await?;
    println!("remove reply: {reply}");

    let seq = cart.sequence_nr().await?;
    cart.passivate().await;

    let cart = store.get::<ShoppingCart>("alice").await?;
    if let CartReply::Cart(contents) = cart.send(CartCommand::GetCart, ctx).await? {
        println!("after recovery (sequence {seq}):");
        for item in &contents.items {
            println!("  {:<8} {:<8} x{}", item.product_id, item.name, item.quantity);
        }
    }

    let layout = StorageLayout::new(&data_dir);
    for persistence_id in layout.list_persistence_ids()? {
        println!("journaled under {}: {persistence_id}", layout.base_dir().display());
    }

    Ok(())
}
