//! End-to-end behavior of the shopping cart through the entity store.

use std::sync::Arc;
use std::time::Duration;

use entityfold::shopping_cart::{
    self, Cart, CartCommand, CartError, CartEvent, CartReply, LineItem, ShoppingCart,
};
use entityfold::{
    CommandContext, CommandEnvelope, CommandError, DispatchError, EntityHandle, EntityStore,
    InMemoryJournal, InMemorySnapshotStore, Journal, SnapshotStore, StorageLayout, decode_event,
    replay,
};
use serde_json::json;
use tempfile::TempDir;

fn open_store() -> EntityStore {
    EntityStore::builder()
        .register::<ShoppingCart>(shopping_cart::SERVICE_NAME, shopping_cart::config())
        .open()
        .expect("cart registration is valid")
}

fn add(product_id: &str, quantity: i32) -> CartCommand {
    CartCommand::AddItem {
        product_id: product_id.into(),
        name: "Widget".into(),
        quantity,
    }
}

fn remove(product_id: &str) -> CartCommand {
    CartCommand::RemoveItem {
        product_id: product_id.into(),
    }
}

fn line(product_id: &str, quantity: i32) -> LineItem {
    LineItem {
        product_id: product_id.into(),
        name: "Widget".into(),
        quantity,
    }
}

async fn send(
    cart: &EntityHandle<ShoppingCart>,
    cmd: CartCommand,
) -> Result<CartReply, CommandError<CartError>> {
    cart.send(cmd, CommandContext::default()).await
}

async fn state(cart: &EntityHandle<ShoppingCart>) -> Cart {
    cart.state().await.expect("cart should be active")
}

/// Every event persisted for `entity_id`, decoded.
fn journaled_events(store: &EntityStore, entity_id: &str) -> Vec<CartEvent> {
    store
        .journal()
        .read(shopping_cart::PERSISTENCE_ID, entity_id, 0)
        .expect("journal read")
        .iter()
        .map(|record| decode_event::<ShoppingCart>(record).expect("decodable event"))
        .collect()
}

// --- Commands ---

#[tokio::test]
async fn first_add_creates_line_item() {
    let store = open_store();
    let cart = store.get::<ShoppingCart>("user-1").await.unwrap();

    let reply = send(&cart, add("p1", 3)).await.unwrap();

    assert_eq!(reply, CartReply::Empty);
    assert_eq!(state(&cart).await.items, vec![line("p1", 3)]);
}

#[tokio::test]
async fn adding_same_product_merges_quantity() {
    let store = open_store();
    let cart = store.get::<ShoppingCart>("user-1").await.unwrap();

    send(&cart, add("p1", 3)).await.unwrap();
    send(&cart, add("p1", 2)).await.unwrap();

    assert_eq!(state(&cart).await.items, vec![line("p1", 5)]);
}

#[tokio::test]
async fn removing_only_item_empties_cart() {
    let store = open_store();
    let cart = store.get::<ShoppingCart>("user-1").await.unwrap();

    send(&cart, add("p1", 3)).await.unwrap();
    send(&cart, remove("p1")).await.unwrap();

    assert!(state(&cart).await.items.is_empty());
}

#[tokio::test]
async fn removing_from_empty_cart_is_rejected() {
    let store = open_store();
    let cart = store.get::<ShoppingCart>("user-1").await.unwrap();

    let err = send(&cart, remove("p1")).await.unwrap_err();

    assert_eq!(err.to_string(), "Item p1 not in cart");
    assert!(state(&cart).await.items.is_empty());
    assert!(journaled_events(&store, "user-1").is_empty());
}

#[tokio::test]
async fn negative_quantity_is_rejected() {
    let store = open_store();
    let cart = store.get::<ShoppingCart>("user-1").await.unwrap();

    let err = send(&cart, add("p1", -1)).await.unwrap_err();

    assert!(matches!(
        err.rejection(),
        Some(CartError::NegativeQuantity { product_id }) if product_id == "p1"
    ));
    assert!(err.to_string().contains("quantity"));
    assert!(state(&cart).await.items.is_empty());
    assert_eq!(cart.sequence_nr().await.unwrap(), 0);
}

#[tokio::test]
async fn quantity_past_i32_max_is_rejected() {
    let store = open_store();
    let cart = store.get::<ShoppingCart>("user-1").await.unwrap();
    send(&cart, add("p1", i32::MAX)).await.unwrap();

    let err = send(&cart, add("p1", 1)).await.unwrap_err();

    assert!(matches!(
        err.rejection(),
        Some(CartError::QuantityOverflow { product_id, quantity: 1 }) if product_id == "p1"
    ));
    assert!(cart.is_alive());
    assert_eq!(state(&cart).await.items, vec![line("p1", i32::MAX)]);
    assert_eq!(journaled_events(&store, "user-1").len(), 1);

    // The cart still recovers cleanly from its journal.
    cart.passivate().await;
    let cart = store.get::<ShoppingCart>("user-1").await.unwrap();
    assert_eq!(state(&cart).await.quantity_of("p1"), i32::MAX);
    send(&cart, add("p2", 1)).await.unwrap();
    assert_eq!(cart.sequence_nr().await.unwrap(), 2);
}

// --- Properties ---

#[tokio::test]
async fn quantity_is_sum_of_accepted_adds() {
    let sequences: [&[i32]; 4] = [&[1], &[3, 2], &[5, -4, 0, 7, 1], &[100, 1, 1, 1, -100, 2]];

    for (i, quantities) in sequences.into_iter().enumerate() {
        let store = open_store();
        let cart = store.get::<ShoppingCart>(&format!("cart-{i}")).await.unwrap();
        for &q in quantities {
            let _ = send(&cart, add("p1", q)).await;
        }

        let expected: i32 = quantities.iter().filter(|q| **q >= 1).sum();
        assert_eq!(state(&cart).await.quantity_of("p1"), expected, "sequence {quantities:?}");
    }
}

#[tokio::test]
async fn invalid_quantity_never_changes_state() {
    let store = open_store();
    let cart = store.get::<ShoppingCart>("user-1").await.unwrap();
    send(&cart, add("p1", 2)).await.unwrap();
    send(&cart, add("p2", 4)).await.unwrap();

    for q in [0, -1, -50, i32::MIN] {
        for product in ["p1", "p2", "p3"] {
            let before = state(&cart).await;
            let seq = cart.sequence_nr().await.unwrap();

            assert!(send(&cart, add(product, q)).await.is_err());

            assert_eq!(state(&cart).await, before);
            assert_eq!(cart.sequence_nr().await.unwrap(), seq);
        }
    }
    assert_eq!(journaled_events(&store, "user-1").len(), 2);
}

#[tokio::test]
async fn removing_absent_item_never_changes_state() {
    let store = open_store();
    let cart = store.get::<ShoppingCart>("user-1").await.unwrap();
    send(&cart, add("p1", 1)).await.unwrap();
    send(&cart, remove("p1")).await.unwrap();

    let before = state(&cart).await;
    for product in ["p1", "p2", ""] {
        let err = send(&cart, remove(product)).await.unwrap_err();
        assert_eq!(err.to_string(), format!("Item {product} not in cart"));
    }
    assert_eq!(state(&cart).await, before);
    assert_eq!(cart.sequence_nr().await.unwrap(), 2);
}

#[tokio::test]
async fn remove_leaves_other_items_untouched() {
    let store = open_store();
    let cart = store.get::<ShoppingCart>("user-1").await.unwrap();
    for (product, q) in [("p1", 1), ("p2", 2), ("p3", 3), ("p2", 5)] {
        send(&cart, add(product, q)).await.unwrap();
    }

    send(&cart, remove("p2")).await.unwrap();

    assert_eq!(state(&cart).await.items, vec![line("p1", 1), line("p3", 3)]);
}

#[tokio::test]
async fn get_cart_never_mutates_or_emits() {
    let store = open_store();
    let cart = store.get::<ShoppingCart>("user-1").await.unwrap();

    for step in [add("p1", 2), add("p2", 1), remove("p1")] {
        let before = state(&cart).await;
        let seq = cart.sequence_nr().await.unwrap();

        let reply = send(&cart, CartCommand::GetCart).await.unwrap();

        assert_eq!(reply, CartReply::Cart(before.clone()));
        assert_eq!(state(&cart).await, before);
        assert_eq!(cart.sequence_nr().await.unwrap(), seq);

        send(&cart, step).await.unwrap();
    }
}

#[tokio::test]
async fn get_cart_returns_a_copy() {
    let store = open_store();
    let cart = store.get::<ShoppingCart>("user-1").await.unwrap();
    send(&cart, add("p1", 2)).await.unwrap();

    let Ok(CartReply::Cart(mut copy)) = send(&cart, CartCommand::GetCart).await else {
        panic!("GetCart should reply with the cart");
    };
    copy.items.clear();

    assert_eq!(state(&cart).await.quantity_of("p1"), 2);
}

#[tokio::test]
async fn replay_of_journal_matches_live_state() {
    let store = open_store();
    let cart = store.get::<ShoppingCart>("user-1").await.unwrap();
    let commands = [
        add("p1", 3),
        add("p2", 1),
        remove("p9"),
        add("p1", 2),
        add("p3", -1),
        remove("p2"),
        add("p2", 6),
        CartCommand::GetCart,
    ];
    for cmd in commands {
        let _ = send(&cart, cmd).await;
    }

    let events = journaled_events(&store, "user-1");
    assert_eq!(events.len(), 5);
    assert_eq!(replay::<ShoppingCart>("user-1", &events), state(&cart).await);
}

// --- Persistence and lifecycle ---

#[tokio::test]
async fn events_carry_command_metadata() {
    let store = open_store();
    let cart = store.get::<ShoppingCart>("user-1").await.unwrap();
    let ctx = CommandContext::default()
        .with_actor("checkout-ui")
        .with_correlation_id("req-42");

    cart.send(add("p1", 1), ctx).await.unwrap();

    let records = store
        .journal()
        .read(shopping_cart::PERSISTENCE_ID, "user-1", 0)
        .unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.sequence_nr, 1);
    assert_eq!(record.event_type, "ItemAdded");
    assert_eq!(record.payload["quantity"], 1);
    assert_eq!(record.metadata.entity_type, "shopping-cart");
    assert_eq!(record.metadata.entity_id, "user-1");
    assert_eq!(record.metadata.actor.as_deref(), Some("checkout-ui"));
    assert_eq!(record.metadata.correlation_id.as_deref(), Some("req-42"));
}

#[tokio::test]
async fn snapshot_every_five_events() {
    let journal: Arc<dyn Journal> = Arc::new(InMemoryJournal::new());
    let snapshots: Arc<dyn SnapshotStore> = Arc::new(InMemorySnapshotStore::new());
    let open = || {
        EntityStore::builder()
            .journal(Arc::clone(&journal))
            .snapshot_store(Arc::clone(&snapshots))
            .register::<ShoppingCart>(shopping_cart::SERVICE_NAME, shopping_cart::config())
            .open()
            .unwrap()
    };

    let store = open();
    let cart = store.get::<ShoppingCart>("user-1").await.unwrap();
    for i in 0..4 {
        send(&cart, add(&format!("p{i}"), 1)).await.unwrap();
    }
    assert!(
        snapshots
            .load(shopping_cart::PERSISTENCE_ID, "user-1")
            .unwrap()
            .is_none()
    );

    // Rejections do not count towards the snapshot interval.
    let _ = send(&cart, add("p0", -1)).await;
    send(&cart, add("p0", 1)).await.unwrap();
    send(&cart, add("p9", 1)).await.unwrap();

    let snapshot = snapshots
        .load(shopping_cart::PERSISTENCE_ID, "user-1")
        .unwrap()
        .expect("snapshot at sequence 5");
    assert_eq!(snapshot.sequence_nr, 5);
    let snapped: Cart = snapshot.into_typed().unwrap().state;
    assert_eq!(snapped.quantity_of("p0"), 2);
    assert_eq!(snapped.quantity_of("p9"), 0);

    let live = state(&cart).await;
    cart.passivate().await;

    // A fresh store recovers from the snapshot plus one tail event.
    let store = open();
    let cart = store.get::<ShoppingCart>("user-1").await.unwrap();
    assert_eq!(state(&cart).await, live);
    assert_eq!(cart.sequence_nr().await.unwrap(), 6);
}

#[tokio::test]
async fn passivated_cart_recovers_identical_state() {
    let store = open_store();
    let cart = store.get::<ShoppingCart>("user-1").await.unwrap();
    for cmd in [add("p1", 2), add("p2", 3), remove("p1"), add("p1", 4)] {
        send(&cart, cmd).await.unwrap();
    }
    let before = state(&cart).await;

    cart.passivate().await;
    assert!(!cart.is_alive());
    assert!(matches!(
        send(&cart, CartCommand::GetCart).await,
        Err(CommandError::EntityGone)
    ));

    let cart = store.get::<ShoppingCart>("user-1").await.unwrap();
    assert_eq!(state(&cart).await, before);
    assert_eq!(cart.state().await.unwrap().items[0].product_id, "p2");
}

#[tokio::test]
async fn idle_cart_is_passivated_and_recovered() {
    let store = EntityStore::builder()
        .idle_timeout(Duration::from_millis(200))
        .register::<ShoppingCart>(shopping_cart::SERVICE_NAME, shopping_cart::config())
        .open()
        .unwrap();
    let cart = store.get::<ShoppingCart>("user-1").await.unwrap();
    send(&cart, add("p1", 2)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!cart.is_alive());

    let cart = store.get::<ShoppingCart>("user-1").await.unwrap();
    assert_eq!(state(&cart).await.items, vec![line("p1", 2)]);
}

#[tokio::test]
async fn file_backed_carts_survive_restart() {
    let tmp = TempDir::new().expect("failed to create temp dir");
    let open = || {
        EntityStore::builder()
            .base_dir(tmp.path())
            .register::<ShoppingCart>(shopping_cart::SERVICE_NAME, shopping_cart::config())
            .open()
            .unwrap()
    };

    let expected = {
        let store = open();
        let cart = store.get::<ShoppingCart>("user-1").await.unwrap();
        for i in 0..7 {
            send(&cart, add(&format!("p{}", i % 3), i + 1)).await.unwrap();
        }
        send(&cart, remove("p1")).await.unwrap();
        let s = state(&cart).await;
        cart.passivate().await;
        s
    };

    let store = open();
    let cart = store.get::<ShoppingCart>("user-1").await.unwrap();
    assert_eq!(state(&cart).await, expected);
    assert_eq!(cart.sequence_nr().await.unwrap(), 8);

    // p0: 1 + 4 + 7, p2: 3 + 6
    assert_eq!(expected.items, vec![line("p0", 12), line("p2", 9)]);

    let layout = StorageLayout::new(tmp.path());
    assert_eq!(
        layout.list_persistence_ids().expect("listing should succeed"),
        vec![shopping_cart::PERSISTENCE_ID.to_owned()]
    );
}

#[tokio::test]
async fn carts_are_independent() {
    let store = open_store();
    let alice = store.get::<ShoppingCart>("alice").await.unwrap();
    let bob = store.get::<ShoppingCart>("bob").await.unwrap();

    send(&alice, add("p1", 1)).await.unwrap();
    send(&bob, add("p1", 5)).await.unwrap();
    send(&alice, remove("p1")).await.unwrap();

    assert!(state(&alice).await.items.is_empty());
    assert_eq!(state(&bob).await.items, vec![line("p1", 5)]);
}

#[tokio::test]
async fn dispatch_drives_the_same_cart() {
    let store = open_store();
    let envelope = |command| CommandEnvelope::new(shopping_cart::SERVICE_NAME, "user-1", command);

    store
        .dispatch(envelope(json!({
            "type": "AddItem",
            "data": {"productId": "p1", "name": "Widget", "quantity": 3}
        })))
        .await
        .unwrap();

    let err = store
        .dispatch(envelope(json!({
            "type": "AddItem",
            "data": {"productId": "p1", "name": "Widget", "quantity": -1}
        })))
        .await
        .unwrap_err();
    assert!(
        matches!(&err, DispatchError::Rejected(reason) if reason == "Cannot add negative quantity to item p1")
    );

    let reply = store
        .dispatch(envelope(json!({"type": "GetCart"})))
        .await
        .unwrap();
    assert_eq!(
        reply,
        json!({
            "type": "Cart",
            "data": {"items": [{"productId": "p1", "name": "Widget", "quantity": 3}]}
        })
    );
}
