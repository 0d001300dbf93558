use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::BookingEvent;

const CHANNEL_CAPACITY: usize = 256;
const FIREHOSE_CAPACITY: usize = 1024;

/// Broadcast hub: one channel per facility for LISTEN subscribers, plus a
/// firehose carrying every event for the stats dispatcher. Downstream
/// consumers are best-effort by construction — a send with no receiver,
/// or a lagged receiver, never affects the write that produced the event.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<BookingEvent>>,
    firehose: broadcast::Sender<BookingEvent>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            firehose: broadcast::channel(FIREHOSE_CAPACITY).0,
        }
    }

    /// Subscribe to one facility's events. Creates the channel if needed.
    pub fn subscribe(&self, facility_id: Ulid) -> broadcast::Receiver<BookingEvent> {
        let sender = self
            .channels
            .entry(facility_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Subscribe to every event across all facilities.
    pub fn subscribe_all(&self) -> broadcast::Receiver<BookingEvent> {
        self.firehose.subscribe()
    }

    /// Fan out a committed event. No-op when nobody is listening.
    pub fn send(&self, facility_id: Ulid, event: &BookingEvent) {
        if let Some(sender) = self.channels.get(&facility_id) {
            let _ = sender.send(event.clone());
        }
        let _ = self.firehose.send(event.clone());
    }

    /// Remove a facility's channel (e.g. when the facility is removed).
    pub fn remove(&self, facility_id: &Ulid) {
        self.channels.remove(facility_id);
    }
}
