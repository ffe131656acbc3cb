use std::sync::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// traffic totals of one transport stack
#[derive(Default)]
pub struct TrafficCounters {
    totals: Mutex<TrafficSnapshot>,
}

impl TrafficCounters {
    pub fn on_sent(&self, num_bytes: usize) {
        let mut totals = self.totals.lock().unwrap();
        totals.bytes_sent += num_bytes as u64;
        totals.messages_sent += 1;
    }

    pub fn on_received(&self, num_bytes: usize) {
        let mut totals = self.totals.lock().unwrap();
        totals.bytes_received += num_bytes as u64;
        totals.messages_received += 1;
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        *self.totals.lock().unwrap()
    }
}
