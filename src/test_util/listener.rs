use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::Notify;

use crate::delivery::{Delivery, MessageListener};
use crate::error::DeliveryError;
use crate::messaging::node_addr::NodeAddr;

/// A [MessageListener] that records everything it is passed
#[derive(Default)]
pub struct CollectingListener {
    deliveries: Mutex<Vec<Delivery>>,
    errors: Mutex<Vec<DeliveryError>>,
    notify: Notify,
}

impl CollectingListener {
    pub fn new() -> CollectingListener {
        Default::default()
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn num_deliveries(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }

    /// the raw seqnos delivered from `sender`, in order of delivery
    pub fn seqnos_from(&self, sender: NodeAddr, multicast: bool) -> Vec<u64> {
        self.deliveries.lock().unwrap().iter()
            .filter(|d| d.sender == sender && d.multicast == multicast)
            .map(|d| d.seqno.to_raw())
            .collect()
    }

    pub fn payloads_from(&self, sender: NodeAddr, multicast: bool) -> Vec<Bytes> {
        self.deliveries.lock().unwrap().iter()
            .filter(|d| d.sender == sender && d.multicast == multicast)
            .map(|d| d.payload.clone())
            .collect()
    }

    pub fn errors(&self) -> Vec<DeliveryError> {
        self.errors.lock().unwrap().clone()
    }

    pub async fn wait_for_deliveries(&self, num: usize) {
        loop {
            let notified = self.notify.notified();
            if self.num_deliveries() >= num {
                return;
            }
            notified.await;
        }
    }
}

impl MessageListener for CollectingListener {
    fn deliver(&self, delivery: Delivery) {
        self.deliveries.lock().unwrap().push(delivery);
        self.notify.notify_waiters();
    }

    fn on_delivery_error(&self, error: DeliveryError) {
        self.errors.lock().unwrap().push(error);
        self.notify.notify_waiters();
    }
}
