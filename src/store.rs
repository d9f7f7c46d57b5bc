use std::collections::{BTreeSet, HashMap, VecDeque};
use std::pin::Pin;
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime};

use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio::sync::broadcast::Sender;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::adapter::AdvertisementObservation;

/// Observations kept per device for the interval estimate and RSSI history.
const HISTORY_DEPTH: usize = 16;

const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Aggregated broadcast state of one observed device.
///
/// Scalar fields always reflect the most recent observation, while
/// `service_uuids` and `manufacturer_data` accumulate across
/// observations: peripherals commonly rotate their advertisement
/// contents between packets.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub tx_power: Option<i16>,
    pub service_uuids: BTreeSet<Uuid>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Raw bytes of the most recent observation.
    pub raw_payload: Vec<u8>,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
    rssi_history: VecDeque<i16>,
    observed_at: VecDeque<Instant>,
}

impl Advertisement {
    fn new(observation: AdvertisementObservation, now: SystemTime) -> Self {
        let mut advertisement = Self {
            address: observation.address.clone(),
            name: None,
            rssi: None,
            tx_power: None,
            service_uuids: BTreeSet::new(),
            manufacturer_data: HashMap::new(),
            raw_payload: Vec::new(),
            first_seen: now,
            last_seen: now,
            rssi_history: VecDeque::new(),
            observed_at: VecDeque::new(),
        };
        advertisement.merge(observation, now);
        advertisement
    }

    fn merge(&mut self, observation: AdvertisementObservation, now: SystemTime) {
        self.name = observation.name;
        self.rssi = observation.rssi;
        self.tx_power = observation.tx_power;
        self.raw_payload = observation.raw_payload;
        self.service_uuids.extend(observation.service_uuids);
        self.manufacturer_data.extend(observation.manufacturer_data);
        self.last_seen = now;

        if let Some(rssi) = observation.rssi {
            if self.rssi_history.len() == HISTORY_DEPTH {
                self.rssi_history.pop_front();
            }
            self.rssi_history.push_back(rssi);
        }
        if self.observed_at.len() == HISTORY_DEPTH {
            self.observed_at.pop_front();
        }
        self.observed_at.push_back(Instant::now());
    }

    /// Recent RSSI readings, oldest first.
    pub fn rssi_history(&self) -> impl Iterator<Item = i16> + '_ {
        self.rssi_history.iter().copied()
    }

    /// Estimated advertising interval, derived as the smallest gap
    /// between recent observations. `None` until the device has been
    /// observed at least twice.
    pub fn interval_estimate(&self) -> Option<Duration> {
        self.observed_at
            .iter()
            .zip(self.observed_at.iter().skip(1))
            .map(|(earlier, later)| *later - *earlier)
            .min()
    }
}

/// Whether an upsert created a new entry or updated an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// One store mutation, as seen by observers.
#[derive(Debug, Clone)]
pub struct StoreUpdate {
    pub advertisement: Advertisement,
    pub outcome: UpsertOutcome,
}

/// Table of observed devices, keyed by address.
///
/// Mutated only by the scan controller; read by any number of
/// concurrent observers. [`snapshot`](Self::snapshot) is taken under
/// the same lock as mutation, so it always reflects a consistent
/// point-in-time view.
///
/// Observers subscribe to a broadcast feed. A receiver that falls
/// behind may miss intermediate updates for a busy device, but the
/// table itself always holds the latest state, so a lagging observer
/// can resynchronize from a snapshot.
pub struct AdvertisementStore {
    entries: RwLock<HashMap<String, Advertisement>>,
    update_sender: Sender<StoreUpdate>,
}

impl Default for AdvertisementStore {
    fn default() -> Self {
        AdvertisementStore::new()
    }
}

impl AdvertisementStore {
    pub fn new() -> Self {
        let (update_sender, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        Self {
            entries: RwLock::new(HashMap::new()),
            update_sender,
        }
    }

    /// Merge an observation into the table.
    pub fn upsert(&self, observation: AdvertisementObservation) -> UpsertOutcome {
        let now = SystemTime::now();

        let (update, outcome) = {
            let mut entries = self.entries.write().unwrap();

            let (entry, outcome) = match entries.get_mut(&observation.address) {
                Some(entry) => {
                    entry.merge(observation, now);
                    (entry, UpsertOutcome::Updated)
                }
                None => {
                    log::debug!("New device observed: {}", observation.address);
                    let address = observation.address.clone();
                    let entry = entries
                        .entry(address)
                        .or_insert_with(|| Advertisement::new(observation, now));
                    (entry, UpsertOutcome::Inserted)
                }
            };

            (
                StoreUpdate {
                    advertisement: entry.clone(),
                    outcome,
                },
                outcome,
            )
        };

        self.update_sender.send(update).ok();

        outcome
    }

    pub fn get(&self, address: &str) -> Option<Advertisement> {
        self.entries.read().unwrap().get(address).cloned()
    }

    /// Current entries, most recently seen first.
    pub fn snapshot(&self) -> Vec<Advertisement> {
        let entries = self.entries.read().unwrap();

        let mut snapshot = entries.values().cloned().collect::<Vec<_>>();
        snapshot.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        snapshot
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }

    /// Subscribe to store mutations.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreUpdate> {
        self.update_sender.subscribe()
    }

    /// Store mutations as a stream. Updates missed due to lag are
    /// skipped; the latest state is always available via `snapshot`.
    pub fn update_stream(&self) -> Pin<Box<dyn Stream<Item = StoreUpdate> + Send>> {
        let receiver = self.update_sender.subscribe();

        Box::pin(BroadcastStream::new(receiver).filter_map(|x| async move { x.ok() }))
    }
}
