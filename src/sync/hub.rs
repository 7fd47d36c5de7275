//! Replay-latest publish/subscribe, one channel per cache key.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

use crate::cache::{CacheKey, Snapshot};
use crate::provider::ProviderError;

/// What a subscriber sees for a key. Both fields empty means "no data yet".
#[derive(Debug)]
pub struct Update<T> {
  pub snapshot: Option<Arc<Snapshot<T>>>,
  /// Set when the latest refresh failed; the snapshot (if any) is stale
  pub error: Option<ProviderError>,
}

impl<T> Update<T> {
  pub fn data(snapshot: Arc<Snapshot<T>>) -> Self {
    Self {
      snapshot: Some(snapshot),
      error: None,
    }
  }

  pub fn failed(snapshot: Option<Arc<Snapshot<T>>>, error: ProviderError) -> Self {
    Self {
      snapshot,
      error: Some(error),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.snapshot.is_none() && self.error.is_none()
  }

  pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
    self.snapshot.as_ref().map(|s| s.fetched_at)
  }
}

impl<T> Default for Update<T> {
  fn default() -> Self {
    Self {
      snapshot: None,
      error: None,
    }
  }
}

impl<T> Clone for Update<T> {
  fn clone(&self) -> Self {
    Self {
      snapshot: self.snapshot.clone(),
      error: self.error.clone(),
    }
  }
}

type Callback<T> = Arc<dyn Fn(&Update<T>) + Send + Sync>;

struct Registration<T> {
  callback: Callback<T>,
  active: Arc<AtomicBool>,
}

/// One update waiting to reach a set of callbacks.
struct Pending<T> {
  update: Update<T>,
  targets: Vec<(Callback<T>, Arc<AtomicBool>)>,
}

/// Callback deliveries for one channel, in publish order. Whoever finds the
/// queue idle drains it; everyone else only enqueues.
struct Delivery<T> {
  queue: VecDeque<Pending<T>>,
  draining: bool,
}

impl<T> Delivery<T> {
  /// Queue `pending`, returning true if the caller must drain.
  fn enqueue(&mut self, pending: Pending<T>) -> bool {
    self.queue.push_back(pending);
    !std::mem::replace(&mut self.draining, true)
  }
}

type DeliveryQueue<T> = Arc<Mutex<Delivery<T>>>;

struct Channel<T> {
  sender: watch::Sender<Update<T>>,
  /// Keyed by subscription id, so iteration is subscription order
  callbacks: BTreeMap<u64, Registration<T>>,
  delivery: DeliveryQueue<T>,
}

impl<T> Channel<T> {
  fn new() -> Self {
    let (sender, _) = watch::channel(Update::default());
    Self {
      sender,
      callbacks: BTreeMap::new(),
      delivery: Arc::new(Mutex::new(Delivery {
        queue: VecDeque::new(),
        draining: false,
      })),
    }
  }

  /// Queue `update` for `targets`. Must be called under the hub lock so the
  /// queue order matches the order values were accepted.
  fn queue(&self, update: Update<T>, targets: Vec<(Callback<T>, Arc<AtomicBool>)>) -> Option<DeliveryQueue<T>> {
    let pending = Pending { update, targets };
    let drain = self
      .delivery
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .enqueue(pending);
    drain.then(|| Arc::clone(&self.delivery))
  }
}

struct HubState<T> {
  /// Publishes tagged with an older session generation are dropped
  epoch: u64,
  next_id: u64,
  channels: HashMap<CacheKey, Channel<T>>,
}

/// Receiving end of a key's channel. Dropping it unsubscribes.
pub struct Subscription<T> {
  key: CacheKey,
  receiver: watch::Receiver<Update<T>>,
}

impl<T> Subscription<T> {
  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// The latest value, without waiting.
  pub fn current(&self) -> Update<T> {
    self.receiver.borrow().clone()
  }

  /// Wait for the next update. Returns `None` once the key is dropped (e.g.
  /// on sign-out).
  pub async fn changed(&mut self) -> Option<Update<T>> {
    self.receiver.changed().await.ok()?;
    Some(self.receiver.borrow_and_update().clone())
  }
}

/// Handle for a callback subscription; pass to `BroadcastHub::unsubscribe`.
#[derive(Debug)]
pub struct SubscriptionHandle {
  key: CacheKey,
  id: u64,
  active: Arc<AtomicBool>,
}

impl SubscriptionHandle {
  pub fn key(&self) -> &CacheKey {
    &self.key
  }
}

/// Fans out snapshots to every subscriber of a key and replays the latest one
/// to new subscribers.
pub struct BroadcastHub<T> {
  state: Mutex<HubState<T>>,
}

impl<T> Default for BroadcastHub<T> {
  fn default() -> Self {
    Self {
      state: Mutex::new(HubState {
        epoch: 0,
        next_id: 0,
        channels: HashMap::new(),
      }),
    }
  }
}

impl<T: Send + Sync + 'static> BroadcastHub<T> {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, HubState<T>> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Subscribe to a key. The current value is available immediately through
  /// `Subscription::current`.
  pub fn subscribe(&self, key: &CacheKey) -> Subscription<T> {
    let mut state = self.lock();
    let channel = state.channels.entry(key.clone()).or_insert_with(Channel::new);
    Subscription {
      key: key.clone(),
      receiver: channel.sender.subscribe(),
    }
  }

  /// Register a callback. It fires with the current value (unless there is
  /// none yet) and then on every publish for the key, never seeing an older
  /// snapshot after a newer one.
  pub fn subscribe_with<F>(&self, key: &CacheKey, callback: F) -> SubscriptionHandle
  where
    F: Fn(&Update<T>) + Send + Sync + 'static,
  {
    let callback: Callback<T> = Arc::new(callback);
    let active = Arc::new(AtomicBool::new(true));

    let (id, drain) = {
      let mut state = self.lock();
      let id = state.next_id;
      state.next_id += 1;

      let channel = state.channels.entry(key.clone()).or_insert_with(Channel::new);
      channel.callbacks.insert(
        id,
        Registration {
          callback: Arc::clone(&callback),
          active: Arc::clone(&active),
        },
      );
      let current = channel.sender.borrow().clone();
      let drain = if current.is_empty() {
        None
      } else {
        channel.queue(current, vec![(callback, Arc::clone(&active))])
      };
      (id, drain)
    };

    if let Some(delivery) = drain {
      deliver(key, &delivery);
    }

    SubscriptionHandle {
      key: key.clone(),
      id,
      active,
    }
  }

  pub fn unsubscribe(&self, handle: SubscriptionHandle) {
    handle.active.store(false, Ordering::SeqCst);
    let mut state = self.lock();
    if let Some(channel) = state.channels.get_mut(&handle.key) {
      channel.callbacks.remove(&handle.id);
    }
  }

  /// The latest value for a key (empty if nothing was ever published).
  pub fn current(&self, key: &CacheKey) -> Update<T> {
    self
      .lock()
      .channels
      .get(key)
      .map(|channel| channel.sender.borrow().clone())
      .unwrap_or_default()
  }

  /// Publish an update to every subscriber of `key`.
  ///
  /// Returns false if the update was dropped: it was tagged with a session
  /// generation older than the hub's epoch, or it carries a snapshot older
  /// than the one subscribers already have. An error-only update keeps the
  /// snapshot subscribers already have.
  pub fn publish(&self, key: &CacheKey, update: Update<T>, generation: u64) -> bool {
    let drain = {
      let mut state = self.lock();
      if generation < state.epoch {
        return false;
      }

      let channel = state.channels.entry(key.clone()).or_insert_with(Channel::new);
      let previous = channel.sender.borrow().clone();

      let update = match (previous.fetched_at(), update.fetched_at()) {
        (Some(prev), Some(next)) if next < prev => return false,
        (Some(_), None) => Update {
          snapshot: previous.snapshot,
          error: update.error,
        },
        _ => update,
      };

      channel.sender.send_replace(update.clone());
      let targets: Vec<(Callback<T>, Arc<AtomicBool>)> = channel
        .callbacks
        .values()
        .map(|r| (Arc::clone(&r.callback), Arc::clone(&r.active)))
        .collect();
      if targets.is_empty() {
        None
      } else {
        channel.queue(update, targets)
      }
    };

    // Callbacks run outside the hub lock so they may subscribe, unsubscribe
    // or publish.
    if let Some(delivery) = drain {
      deliver(key, &delivery);
    }
    true
  }

  /// Drop every key and callback, resetting subscribers to "no data", and
  /// ignore future publishes tagged with a generation below `epoch`.
  pub fn clear(&self, epoch: u64) {
    let mut state = self.lock();
    state.epoch = state.epoch.max(epoch);
    for (_, channel) in state.channels.drain() {
      for registration in channel.callbacks.values() {
        registration.active.store(false, Ordering::SeqCst);
      }
      channel
        .delivery
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .queue
        .clear();
      channel.sender.send_replace(Update::default());
    }
  }
}

/// Drain a channel's delivery queue until it is empty.
fn deliver<T>(key: &CacheKey, delivery: &Mutex<Delivery<T>>) {
  loop {
    let next = {
      let mut delivery = delivery.lock().unwrap_or_else(PoisonError::into_inner);
      match delivery.queue.pop_front() {
        Some(next) => next,
        None => {
          delivery.draining = false;
          return;
        }
      }
    };

    for (callback, active) in &next.targets {
      if active.load(Ordering::SeqCst) {
        invoke(key, callback, &next.update);
      }
    }
  }
}

/// Run one callback, containing any panic to that subscriber.
fn invoke<T>(key: &CacheKey, callback: &Callback<T>, update: &Update<T>) {
  if catch_unwind(AssertUnwindSafe(|| callback(update))).is_err() {
    tracing::warn!(key = %key, "subscriber callback panicked; continuing delivery");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn snap(value: u32, at: i64) -> Arc<Snapshot<u32>> {
    Arc::new(Snapshot::new(value, Utc.timestamp_opt(1_700_000_000 + at, 0).unwrap()))
  }

  fn key() -> CacheKey {
    CacheKey::new("fitness", "u1")
  }

  #[test]
  fn test_subscribe_before_any_data_is_empty() {
    let hub: BroadcastHub<u32> = BroadcastHub::new();
    let sub = hub.subscribe(&key());
    assert!(sub.current().is_empty());
  }

  #[test]
  fn test_subscribe_replays_latest() {
    let hub = BroadcastHub::new();
    hub.publish(&key(), Update::data(snap(1000, 0)), 1);

    let sub = hub.subscribe(&key());
    assert_eq!(sub.current().snapshot.unwrap().data, 1000);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _handle = hub.subscribe_with(&key(), move |u: &Update<u32>| {
      sink.lock().unwrap().push(u.snapshot.as_ref().unwrap().data);
    });
    assert_eq!(*seen.lock().unwrap(), vec![1000]);
  }

  #[tokio::test]
  async fn test_changed_delivers_next_update() {
    let hub = BroadcastHub::new();
    let mut sub = hub.subscribe(&key());

    hub.publish(&key(), Update::data(snap(5, 0)), 1);
    let update = sub.changed().await.unwrap();
    assert_eq!(update.snapshot.unwrap().data, 5);
  }

  #[test]
  fn test_callbacks_fire_in_subscription_order() {
    let hub = BroadcastHub::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    for name in ["first", "second", "third"] {
      let order = Arc::clone(&order);
      hub.subscribe_with(&key(), move |_: &Update<u32>| order.lock().unwrap().push(name));
    }
    hub.publish(&key(), Update::data(snap(1, 0)), 1);

    assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
  }

  #[test]
  fn test_panicking_subscriber_does_not_block_others() {
    let hub = BroadcastHub::new();
    let delivered = Arc::new(AtomicBool::new(false));

    hub.subscribe_with(&key(), |_: &Update<u32>| panic!("broken screen"));
    let flag = Arc::clone(&delivered);
    hub.subscribe_with(&key(), move |_: &Update<u32>| flag.store(true, Ordering::SeqCst));

    assert!(hub.publish(&key(), Update::data(snap(1, 0)), 1));
    assert!(delivered.load(Ordering::SeqCst));
  }

  #[test]
  fn test_unsubscribed_callback_gets_nothing() {
    let hub = BroadcastHub::new();
    let calls = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&calls);
    let handle = hub.subscribe_with(&key(), move |_: &Update<u32>| *counter.lock().unwrap() += 1);

    hub.publish(&key(), Update::data(snap(1, 0)), 1);
    hub.unsubscribe(handle);
    hub.publish(&key(), Update::data(snap(2, 1)), 1);

    assert_eq!(*calls.lock().unwrap(), 1);
  }

  #[test]
  fn test_older_snapshot_is_not_published() {
    let hub = BroadcastHub::new();
    assert!(hub.publish(&key(), Update::data(snap(2, 10)), 1));
    assert!(!hub.publish(&key(), Update::data(snap(1, 5)), 1));
    assert_eq!(hub.current(&key()).snapshot.unwrap().data, 2);
  }

  #[test]
  fn test_error_keeps_previous_snapshot() {
    let hub = BroadcastHub::new();
    hub.publish(&key(), Update::data(snap(7, 0)), 1);
    hub.publish(
      &key(),
      Update::failed(None, ProviderError::NetworkUnavailable("offline".into())),
      1,
    );

    let current = hub.current(&key());
    assert_eq!(current.snapshot.unwrap().data, 7);
    assert!(current.error.is_some());
  }

  #[test]
  fn test_callback_never_sees_an_older_snapshot() {
    for _ in 0..2000 {
      let hub = Arc::new(BroadcastHub::new());
      hub.publish(&key(), Update::data(snap(1, 0)), 1);

      let seen = Arc::new(Mutex::new(Vec::new()));
      std::thread::scope(|scope| {
        let publisher = Arc::clone(&hub);
        scope.spawn(move || publisher.publish(&key(), Update::data(snap(2, 10)), 1));

        let sink = Arc::clone(&seen);
        hub.subscribe_with(&key(), move |u: &Update<u32>| {
          sink.lock().unwrap().push(u.snapshot.as_ref().unwrap().data);
        });
      });

      let seen = seen.lock().unwrap();
      assert!(seen.windows(2).all(|w| w[0] <= w[1]), "out of order: {:?}", *seen);
      assert_eq!(seen.last(), Some(&2));
    }
  }

  #[test]
  fn test_callback_publishing_from_inside_a_callback_is_delivered_after() {
    let hub = Arc::new(BroadcastHub::new());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    let republish = Arc::clone(&hub);
    hub.subscribe_with(&key(), move |u: &Update<u32>| {
      let value = u.snapshot.as_ref().unwrap().data;
      sink.lock().unwrap().push(value);
      if value == 1 {
        republish.publish(&key(), Update::data(snap(2, 10)), 1);
      }
    });
    hub.publish(&key(), Update::data(snap(1, 0)), 1);

    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
  }

  #[test]
  fn test_cleared_callback_receives_nothing() {
    let hub = BroadcastHub::new();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&calls);
    hub.subscribe_with(&key(), move |u: &Update<u32>| {
      sink.lock().unwrap().push(u.snapshot.as_ref().map(|s| s.data));
    });
    hub.publish(&key(), Update::data(snap(1, 0)), 1);

    hub.clear(2);
    assert!(hub.publish(&key(), Update::data(snap(2, 1)), 2));

    // Only the pre-clear publish reached it; clear itself is not a delivery
    assert_eq!(*calls.lock().unwrap(), vec![Some(1)]);
  }

  #[test]
  fn test_clear_rejects_older_generations() {
    let hub = BroadcastHub::new();
    let sub = hub.subscribe(&key());
    hub.publish(&key(), Update::data(snap(1, 0)), 1);

    hub.clear(2);
    assert!(sub.current().is_empty());
    assert!(!hub.publish(&key(), Update::data(snap(2, 1)), 1));
    assert!(hub.current(&key()).is_empty());
    assert!(hub.publish(&key(), Update::data(snap(3, 2)), 2));
  }
}
