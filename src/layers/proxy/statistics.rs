use crate::FxDashMap;
use std::{
    fmt::Write,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

/// Counts of forwarded requests, by client and by resource.
#[derive(Debug, Default)]
pub struct ProxyStatistics {
    total: AtomicU64,
    by_client: FxDashMap<SocketAddr, u64>,
    by_resource: FxDashMap<String, u64>,
}

impl ProxyStatistics {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn record(&self, client: SocketAddr, resource: &str) {
        self.total.fetch_add(1, Ordering::Relaxed);
        *self.by_client.entry(client).or_default() += 1;
        *self.by_resource.entry(resource.to_string()).or_default() += 1;
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn for_client(&self, client: SocketAddr) -> u64 {
        self.by_client.get(&client).map_or(0, |count| *count)
    }

    pub fn for_resource(&self, resource: &str) -> u64 {
        self.by_resource.get(resource).map_or(0, |count| *count)
    }

    /// A plain text summary, served on the proxy's own resource. Clients and
    /// resources are listed in order.
    pub fn report(&self) -> String {
        let mut clients: Vec<_> = self
            .by_client
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        clients.sort();
        let mut resources: Vec<_> = self
            .by_resource
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        resources.sort();

        let mut report = String::new();
        // Writing to a String cannot fail
        let _ = writeln!(report, "Forwarded requests: {}", self.total());
        let _ = writeln!(report, "Clients served: {}", clients.len());
        for (client, count) in clients {
            let _ = writeln!(report, "  {client}: {count}");
        }
        let _ = writeln!(report, "Resources requested: {}", resources.len());
        for (resource, count) in resources {
            let _ = writeln!(report, "  {resource}: {count}");
        }
        report
    }
}
