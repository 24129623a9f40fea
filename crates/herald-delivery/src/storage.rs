//! Due-store abstraction used by the delay scheduler.
//!
//! Broker adapters persist delayed messages in a time-ordered structure (a
//! Redis sorted set, a database table, a managed queue with visibility
//! timeouts). The scheduler only needs three operations from it: fetch what
//! is due, claim an entry through a short-lived lock, and remove a claimed
//! entry. Everything else stays inside the adapter.

use std::{future::Future, pin::Pin, time::Duration};

use chrono::{DateTime, Utc};
use herald_core::{Message, TransportResult};

/// One persisted member of a due-store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueEntry {
    /// Encoded message envelope as stored by the transport.
    pub member: Vec<u8>,
    /// Score of the member: the time it becomes deliverable.
    pub due_at: DateTime<Utc>,
    /// Lock key derived from the member digest.
    pub lock_key: String,
}

impl DueEntry {
    /// Wraps an encoded member due at `due_at`.
    pub fn new(member: Vec<u8>, due_at: DateTime<Utc>) -> Self {
        let lock_key = Message::digest(&member);
        Self { member, due_at, lock_key }
    }

    /// Encodes `message` into an entry due at `due_at`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error when the envelope cannot be encoded.
    pub fn from_message(message: &Message, due_at: DateTime<Utc>) -> TransportResult<Self> {
        Ok(Self::new(message.encode()?, due_at))
    }

    /// Decodes the stored envelope.
    ///
    /// # Errors
    ///
    /// Returns a serialization error for corrupt members.
    pub fn decode(&self) -> TransportResult<Message> {
        Message::decode(&self.member)
    }
}

/// Time-ordered persistence of delayed messages.
///
/// Implementations must make `claim` atomic across every process polling the
/// same store: of any number of concurrent claims for one entry while its
/// lock is held, exactly one returns `true`.
pub trait DueStore: Send + Sync + std::fmt::Debug + 'static {
    /// Returns up to `limit` entries due at or before `now`, earliest first.
    fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = TransportResult<Vec<DueEntry>>> + Send + '_>>;

    /// Tries to take the entry's lock for `ttl`. Non-blocking.
    fn claim<'a>(
        &'a self,
        entry: &'a DueEntry,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = TransportResult<bool>> + Send + 'a>>;

    /// Removes a claimed entry. Returns `false` if it was already gone.
    fn remove<'a>(
        &'a self,
        entry: &'a DueEntry,
    ) -> Pin<Box<dyn Future<Output = TransportResult<bool>> + Send + 'a>>;
}

pub mod mock {
    //! In-memory due-store and transport.
    //!
    //! Used by tests and by embedders running a single process without a
    //! broker. Lock expiry follows the injected [`Clock`], so tests control
    //! TTL recovery precisely.

    use std::{
        collections::{BTreeMap, HashMap},
        future::Future,
        pin::Pin,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    };

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use herald_core::{Clock, Message, Transport, TransportError, TransportResult};
    use tokio::sync::{mpsc, RwLock};

    use super::{DueEntry, DueStore};

    type EntryKey = (DateTime<Utc>, String);

    /// Sorted-set style due-store kept in memory.
    #[derive(Debug)]
    pub struct MemoryDueStore {
        clock: Arc<dyn Clock>,
        entries: RwLock<BTreeMap<EntryKey, DueEntry>>,
        locks: RwLock<HashMap<String, Instant>>,
        fetch_error: RwLock<Option<String>>,
        claim_attempts: AtomicUsize,
    }

    impl MemoryDueStore {
        /// Creates an empty store whose lock expiry follows `clock`.
        pub fn new(clock: Arc<dyn Clock>) -> Self {
            Self {
                clock,
                entries: RwLock::new(BTreeMap::new()),
                locks: RwLock::new(HashMap::new()),
                fetch_error: RwLock::new(None),
                claim_attempts: AtomicUsize::new(0),
            }
        }

        /// Stores `message` due at `due_at`.
        ///
        /// # Errors
        ///
        /// Returns a serialization error if the message cannot be encoded.
        pub async fn schedule(&self, message: &Message, due_at: DateTime<Utc>) -> TransportResult<DueEntry> {
            let entry = DueEntry::from_message(message, due_at)?;
            self.insert(entry.clone()).await;
            Ok(entry)
        }

        /// Stores a raw entry.
        pub async fn insert(&self, entry: DueEntry) {
            self.entries.write().await.insert((entry.due_at, entry.lock_key.clone()), entry);
        }

        /// Number of stored entries, due or not.
        pub async fn len(&self) -> usize {
            self.entries.read().await.len()
        }

        /// Whether the store holds no entries.
        pub async fn is_empty(&self) -> bool {
            self.entries.read().await.is_empty()
        }

        /// Whether the entry's lock is currently held.
        pub async fn is_locked(&self, entry: &DueEntry) -> bool {
            let now = self.clock.now();
            self.locks.read().await.get(&entry.lock_key).is_some_and(|expires| *expires > now)
        }

        /// Makes every following fetch fail with `message` until cleared.
        pub async fn fail_fetches(&self, message: Option<String>) {
            *self.fetch_error.write().await = message;
        }

        /// Total claim calls observed.
        pub fn claim_attempts(&self) -> usize {
            self.claim_attempts.load(Ordering::SeqCst)
        }
    }

    impl DueStore for MemoryDueStore {
        fn fetch_due(
            &self,
            now: DateTime<Utc>,
            limit: usize,
        ) -> Pin<Box<dyn Future<Output = TransportResult<Vec<DueEntry>>> + Send + '_>> {
            Box::pin(async move {
                if let Some(message) = self.fetch_error.read().await.clone() {
                    return Err(TransportError::store(message));
                }

                let entries = self.entries.read().await;
                Ok(entries
                    .values()
                    .take_while(|entry| entry.due_at <= now)
                    .take(limit)
                    .cloned()
                    .collect())
            })
        }

        fn claim<'a>(
            &'a self,
            entry: &'a DueEntry,
            ttl: Duration,
        ) -> Pin<Box<dyn Future<Output = TransportResult<bool>> + Send + 'a>> {
            Box::pin(async move {
                self.claim_attempts.fetch_add(1, Ordering::SeqCst);
                let now = self.clock.now();

                let mut locks = self.locks.write().await;
                if locks.get(&entry.lock_key).is_some_and(|expires| *expires > now) {
                    return Ok(false);
                }
                locks.insert(entry.lock_key.clone(), now + ttl);
                Ok(true)
            })
        }

        fn remove<'a>(
            &'a self,
            entry: &'a DueEntry,
        ) -> Pin<Box<dyn Future<Output = TransportResult<bool>> + Send + 'a>> {
            Box::pin(async move {
                let key = (entry.due_at, entry.lock_key.clone());
                Ok(self.entries.write().await.remove(&key).is_some())
            })
        }
    }

    /// Transport that hands timely messages to a channel and keeps delayed
    /// messages in a [`MemoryDueStore`].
    #[derive(Debug)]
    pub struct MemoryTransport {
        due_store: Arc<MemoryDueStore>,
        clock: Arc<dyn Clock>,
        sender: mpsc::UnboundedSender<Message>,
        publish_error: RwLock<Option<String>>,
        delayed_publishes: AtomicUsize,
    }

    impl MemoryTransport {
        /// Creates the transport and the receiver of timely messages.
        pub fn new(
            due_store: Arc<MemoryDueStore>,
            clock: Arc<dyn Clock>,
        ) -> (Self, mpsc::UnboundedReceiver<Message>) {
            let (sender, receiver) = mpsc::unbounded_channel();
            let transport = Self {
                due_store,
                clock,
                sender,
                publish_error: RwLock::new(None),
                delayed_publishes: AtomicUsize::new(0),
            };
            (transport, receiver)
        }

        /// Makes every following publish fail with `message` until cleared.
        pub async fn fail_publishes(&self, message: Option<String>) {
            *self.publish_error.write().await = message;
        }

        /// Number of successful delayed publishes.
        pub fn delayed_publishes(&self) -> usize {
            self.delayed_publishes.load(Ordering::SeqCst)
        }

        /// Store backing delayed messages.
        pub fn due_store(&self) -> &Arc<MemoryDueStore> {
            &self.due_store
        }

        async fn check_available(&self, message: &Message) -> TransportResult<()> {
            match self.publish_error.read().await.clone() {
                Some(error) => Err(TransportError::publish(message.topic.to_string(), error)),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn publish(&self, message: Message) -> TransportResult<()> {
            self.check_available(&message).await?;

            if message.is_delayed() {
                let due_at = message.due_at();
                self.due_store.schedule(&message, due_at).await?;
                self.delayed_publishes.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }

            self.sender
                .send(message)
                .map_err(|rejected| TransportError::publish(rejected.0.topic.to_string(), "receiver dropped"))
        }

        async fn publish_delayed(&self, message: Message, delay_seconds: u64) -> TransportResult<()> {
            self.check_available(&message).await?;

            let delay = chrono::Duration::seconds(i64::try_from(delay_seconds).unwrap_or(i64::MAX));
            let due_at = self
                .clock
                .now_utc()
                .checked_add_signed(delay)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            self.due_store.schedule(&message, due_at).await?;
            self.delayed_publishes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
