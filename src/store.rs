//! Top-level entry point: entity registration, activation, and routing of
//! JSON command envelopes to the registered entity types.
//!
//! The store is opened via [`EntityStoreBuilder`], which picks the journal
//! and snapshot backends and validates every registration.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::marker::PhantomData;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, RwLock};

use crate::actor::{ActorConfig, EntityHandle, spawn_entity};
use crate::command::CommandEnvelope;
use crate::config::EntityConfig;
use crate::entity::EventSourcedEntity;
use crate::error::{ActivationError, ConfigError, DispatchError};
use crate::journal::{FileJournal, InMemoryJournal, Journal};
use crate::snapshot::{FileSnapshotStore, InMemorySnapshotStore, SnapshotStore};

/// Type-erased handle cache keyed by `(TypeId, entity_id)`.
///
/// `Box<dyn Any + Send + Sync>` lets one map hold `EntityHandle<E>` for any
/// `E`; downcasting recovers the typed handle.
type HandleCache = HashMap<(TypeId, String), Box<dyn Any + Send + Sync>>;

/// One lock per entity currently being activated, keyed like [`HandleCache`].
type ActivationLocks = HashMap<(TypeId, String), Arc<AsyncMutex<()>>>;

/// Dispatchers keyed by service name.
type DispatcherMap = HashMap<String, Box<dyn EntityDispatcher>>;

/// Default idle timeout for actors: 5 minutes.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Discovery record for one registered entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub service_name: String,
    pub entity_type: &'static str,
    pub persistence_id: String,
    /// Descriptor files, resolved against the include directories.
    pub descriptors: Vec<PathBuf>,
}

/// Per-type settings an actor is started with.
#[derive(Debug, Clone)]
struct EntitySettings {
    persistence_id: Arc<str>,
    snapshot_every: Option<NonZeroU64>,
}

/// Registry of entity types and cache of their live instances.
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped. Clones share the
/// same cache, so an entity ID maps to at most one live actor per store.
#[derive(Clone)]
pub struct EntityStore {
    journal: Arc<dyn Journal>,
    snapshots: Arc<dyn SnapshotStore>,
    cache: Arc<RwLock<HandleCache>>,
    activations: Arc<Mutex<ActivationLocks>>,
    entities: Arc<HashMap<TypeId, EntitySettings>>,
    dispatchers: Arc<DispatcherMap>,
    registrations: Arc<[Registration]>,
    idle_timeout: Duration,
}

// Manual `Debug` because `dyn Any` is not `Debug` and we don't want to
// expose cache internals.
impl std::fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore")
            .field("registrations", &self.registrations)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

impl EntityStore {
    pub fn builder() -> EntityStoreBuilder {
        EntityStoreBuilder::new()
    }

    /// Get a handle to an entity, activating it if needed.
    ///
    /// A cached handle is returned while its actor is alive. Otherwise the
    /// entity is recovered from its snapshot and journal on a new actor.
    ///
    /// # Errors
    ///
    /// * [`ActivationError::NotRegistered`] -- `E` was never registered.
    /// * Any recovery failure (journal read, undecodable event, sequence gap).
    pub async fn get<E: EventSourcedEntity>(
        &self,
        entity_id: &str,
    ) -> Result<EntityHandle<E>, ActivationError> {
        let settings = self
            .entities
            .get(&TypeId::of::<E>())
            .ok_or(ActivationError::NotRegistered(E::ENTITY_TYPE))?;
        let key = (TypeId::of::<E>(), entity_id.to_owned());

        // Fast path: check cache with read lock.
        {
            let cache = self.cache.read().await;
            if let Some(handle) = live_handle::<E>(&cache, &key) {
                return Ok(handle);
            }
        }

        // Slow path. Activation is serialized per entity, not per store:
        // callers for other entities only contend on the brief cache locks.
        let lock = self.activation_lock(&key);
        let result = {
            let _activating = lock.lock().await;
            let cached = live_handle::<E>(&*self.cache.read().await, &key);
            match cached {
                Some(handle) => Ok(handle),
                None => self.activate::<E>(entity_id, settings, &key).await,
            }
        };
        self.release_activation_lock(&key, &lock);
        result
    }

    /// Route a JSON command to the entity named by the envelope.
    ///
    /// The command is deserialized into the target entity's command type and
    /// the typed reply serialized back to JSON.
    ///
    /// # Errors
    ///
    /// * [`DispatchError::UnknownService`] -- no entity under that name.
    /// * [`DispatchError::MalformedCommand`] -- the payload fits no command.
    /// * [`DispatchError::Rejected`] -- the entity failed the command.
    /// * [`DispatchError::Activation`] / [`DispatchError::Execution`] --
    ///   infrastructure failures.
    pub async fn dispatch(&self, envelope: CommandEnvelope) -> Result<Value, DispatchError> {
        let dispatcher = self
            .dispatchers
            .get(&envelope.service_name)
            .ok_or_else(|| DispatchError::UnknownService(envelope.service_name.clone()))?;

        tracing::debug!(
            service = %envelope.service_name,
            entity_id = %envelope.entity_id,
            command = envelope.command_name().unwrap_or("<untagged>"),
            "dispatching envelope"
        );
        dispatcher.dispatch(self, envelope).await
    }

    /// Every registered entity type, in registration order.
    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    /// The journal backing every entity of this store.
    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.journal
    }
}

impl EntityStore {
    async fn activate<E: EventSourcedEntity>(
        &self,
        entity_id: &str,
        settings: &EntitySettings,
        key: &(TypeId, String),
    ) -> Result<EntityHandle<E>, ActivationError> {
        tracing::debug!(
            entity_type = E::ENTITY_TYPE,
            entity_id = %entity_id,
            "activating entity"
        );
        let config = ActorConfig {
            journal: Arc::clone(&self.journal),
            snapshots: Arc::clone(&self.snapshots),
            persistence_id: Arc::clone(&settings.persistence_id),
            snapshot_every: settings.snapshot_every,
            idle_timeout: self.idle_timeout,
        };
        let handle = spawn_entity::<E>(entity_id.to_owned(), config).await?;

        self.cache
            .write()
            .await
            .insert(key.clone(), Box::new(handle.clone()));
        Ok(handle)
    }

    fn activation_lock(&self, key: &(TypeId, String)) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .activations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    // Dropped from the map only when no other caller is waiting on it.
    fn release_activation_lock(&self, key: &(TypeId, String), lock: &Arc<AsyncMutex<()>>) {
        let mut locks = self
            .activations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(lock) == 2 {
            locks.remove(key);
        }
    }
}

fn live_handle<E: EventSourcedEntity>(
    cache: &HandleCache,
    key: &(TypeId, String),
) -> Option<EntityHandle<E>> {
    cache
        .get(key)
        .and_then(|boxed| boxed.downcast_ref::<EntityHandle<E>>())
        .filter(|handle| handle.is_alive())
        .cloned()
}

// --- Type-erased dispatch for JSON command envelopes ---

/// Type-erased interface for running a [`CommandEnvelope`] against one
/// entity type.
trait EntityDispatcher: Send + Sync {
    fn dispatch<'a>(
        &'a self,
        store: &'a EntityStore,
        envelope: CommandEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<Value, DispatchError>> + Send + 'a>>;
}

/// Concrete dispatcher for entity type `E`.
struct TypedDispatcher<E> {
    _marker: PhantomData<fn() -> E>,
}

impl<E> TypedDispatcher<E> {
    fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<E> EntityDispatcher for TypedDispatcher<E>
where
    E: EventSourcedEntity,
    E::Command: DeserializeOwned,
    E::Reply: Serialize,
{
    fn dispatch<'a>(
        &'a self,
        store: &'a EntityStore,
        envelope: CommandEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<Value, DispatchError>> + Send + 'a>> {
        Box::pin(async move {
            let cmd: E::Command = serde_json::from_value(envelope.command)
                .map_err(DispatchError::MalformedCommand)?;
            let handle = store.get::<E>(&envelope.entity_id).await?;
            let reply = handle.send(cmd, envelope.context).await?;
            serde_json::to_value(reply).map_err(DispatchError::ReplyEncoding)
        })
    }
}

/// An entity type waiting for [`EntityStoreBuilder::open`].
struct PendingRegistration {
    service_name: String,
    entity_type: &'static str,
    type_id: TypeId,
    config: EntityConfig,
    dispatcher: Box<dyn EntityDispatcher>,
}

/// Builder for configuring and opening an [`EntityStore`].
///
/// Backends default to in-memory. [`base_dir`](EntityStoreBuilder::base_dir)
/// switches both to their file-backed versions; explicitly set backends win
/// over either.
///
/// # Examples
///
/// ```
/// use entityfold::{EntityStore, shopping_cart::{self, ShoppingCart}};
///
/// let store = EntityStore::builder()
///     .register::<ShoppingCart>(shopping_cart::SERVICE_NAME, shopping_cart::config())
///     .open()
///     .expect("cart registration is valid");
///
/// assert_eq!(store.registrations()[0].persistence_id, "shopping-cart");
/// ```
pub struct EntityStoreBuilder {
    journal: Option<Arc<dyn Journal>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    base_dir: Option<PathBuf>,
    idle_timeout: Duration,
    pending: Vec<PendingRegistration>,
}

impl EntityStoreBuilder {
    pub fn new() -> Self {
        Self {
            journal: None,
            snapshots: None,
            base_dir: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            pending: Vec::new(),
        }
    }

    pub fn journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn snapshot_store(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Persist journal and snapshots as files under `path`.
    ///
    /// See [`StorageLayout`](crate::StorageLayout) for the directory layout.
    pub fn base_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.base_dir = Some(path.as_ref().to_owned());
        self
    }

    /// Set the idle timeout for actor passivation.
    ///
    /// Entities that receive no messages for this long are passivated. The
    /// next [`get`](EntityStore::get) transparently recovers them.
    ///
    /// Defaults to 5 minutes.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Register entity type `E` under `service_name`.
    ///
    /// Validation is deferred to [`open`](EntityStoreBuilder::open).
    pub fn register<E>(mut self, service_name: impl Into<String>, config: EntityConfig) -> Self
    where
        E: EventSourcedEntity,
        E::Command: DeserializeOwned,
        E::Reply: Serialize,
    {
        self.pending.push(PendingRegistration {
            service_name: service_name.into(),
            entity_type: E::ENTITY_TYPE,
            type_id: TypeId::of::<E>(),
            config,
            dispatcher: Box::new(TypedDispatcher::<E>::new()),
        });
        self
    }

    /// Validate every registration and build the [`EntityStore`].
    ///
    /// # Errors
    ///
    /// * [`ConfigError::DuplicateService`] / [`ConfigError::DuplicateEntityType`]
    /// * [`ConfigError::EmptyPersistenceId`] / [`ConfigError::JsonFallbackDisabled`]
    /// * [`ConfigError::DescriptorNotFound`] -- a descriptor is in no include dir.
    pub fn open(self) -> Result<EntityStore, ConfigError> {
        let mut services = HashSet::new();
        let mut entities = HashMap::new();
        let mut dispatchers: DispatcherMap = HashMap::new();
        let mut registrations = Vec::with_capacity(self.pending.len());

        for pending in self.pending {
            if !services.insert(pending.service_name.clone()) {
                return Err(ConfigError::DuplicateService(pending.service_name));
            }
            if entities.contains_key(&pending.type_id) {
                return Err(ConfigError::DuplicateEntityType(pending.entity_type));
            }
            pending.config.validate(&pending.service_name)?;
            let descriptors = pending.config.resolve_descriptors()?;

            tracing::info!(
                service = %pending.service_name,
                entity_type = pending.entity_type,
                persistence_id = %pending.config.persistence_id,
                descriptors = descriptors.len(),
                "entity registered"
            );

            entities.insert(
                pending.type_id,
                EntitySettings {
                    persistence_id: Arc::from(pending.config.persistence_id.as_str()),
                    snapshot_every: pending.config.snapshot_every,
                },
            );
            dispatchers.insert(pending.service_name.clone(), pending.dispatcher);
            registrations.push(Registration {
                service_name: pending.service_name,
                entity_type: pending.entity_type,
                persistence_id: pending.config.persistence_id,
                descriptors,
            });
        }

        let journal = match (self.journal, &self.base_dir) {
            (Some(journal), _) => journal,
            (None, Some(dir)) => Arc::new(FileJournal::new(dir)) as Arc<dyn Journal>,
            (None, None) => Arc::new(InMemoryJournal::new()),
        };
        let snapshots = match (self.snapshots, &self.base_dir) {
            (Some(snapshots), _) => snapshots,
            (None, Some(dir)) => Arc::new(FileSnapshotStore::new(dir)) as Arc<dyn SnapshotStore>,
            (None, None) => Arc::new(InMemorySnapshotStore::new()),
        };

        Ok(EntityStore {
            journal,
            snapshots,
            cache: Arc::new(RwLock::new(HashMap::new())),
            activations: Arc::new(Mutex::new(HashMap::new())),
            entities: Arc::new(entities),
            dispatchers: Arc::new(dispatchers),
            registrations: registrations.into(),
            idle_timeout: self.idle_timeout,
        })
    }
}

impl Default for EntityStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}
