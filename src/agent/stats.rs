//! Cluster-wide stats fan-out

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::completion::{PendingOp, Slot};
use crate::error::{MemdError, Result};
use crate::pipeline::PipelineRequest;
use crate::protocol::{Opcode, Packet};
use crate::status::StatusCode;

use super::Agent;

/// Stats reported by one node
#[derive(Debug, Default)]
pub struct SingleServerStats {
    pub stats: HashMap<String, String>,
    /// Why this node's stats are missing or incomplete
    pub error: Option<MemdError>,
}

type StatsMap = HashMap<String, SingleServerStats>;

/// Gathers per-node results and resolves once every node has finished
struct StatsCollector {
    results: Mutex<StatsMap>,
    remaining: AtomicUsize,
    slot: Arc<Slot<StatsMap>>,
}

impl StatsCollector {
    fn finish(&self, address: &str, stats: SingleServerStats) {
        self.results.lock().insert(address.to_string(), stats);
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let results = std::mem::take(&mut *self.results.lock());
            self.slot.resolve(Ok(results));
        }
    }

    fn fail(&self, address: &str, error: MemdError) {
        self.finish(
            address,
            SingleServerStats {
                stats: HashMap::new(),
                error: Some(error),
            },
        );
    }
}

impl Agent {
    /// Fetch the stats group `key` ("" for the default group) from every node
    ///
    /// Resolves once every node has answered or failed; a failing node shows
    /// up with its error rather than failing the whole call.
    pub fn stats(
        &self,
        key: &str,
        callback: impl FnOnce(Result<StatsMap>) + Send + 'static,
    ) -> Result<PendingOp> {
        self.inner.check_open()?;

        let addresses = distinct_nodes(self.topology().nodes());
        let slot = Slot::new(callback);
        if addresses.is_empty() {
            slot.resolve(Ok(HashMap::new()));
            return Ok(PendingOp::new(slot));
        }

        let collector = Arc::new(StatsCollector {
            results: Mutex::new(HashMap::with_capacity(addresses.len())),
            remaining: AtomicUsize::new(addresses.len()),
            slot: Arc::clone(&slot),
        });
        let deadline = Instant::now() + self.inner.config.stats_timeout;
        let key = key.to_string();

        for address in addresses {
            let Some(pipeline) = self.inner.pipelines.read().get(&address).cloned() else {
                collector.fail(
                    &address,
                    MemdError::Routing(format!("no pipeline for {}", address)),
                );
                continue;
            };

            let packet = Packet::request(Opcode::Stat).with_key(key.clone());
            let translator = Arc::clone(&self.inner.translator);
            let node_collector = Arc::clone(&collector);
            let node = address.clone();
            let mut stats = HashMap::new();

            let request = PipelineRequest::new(packet, deadline, slot.clone(), move |result| {
                match result {
                    Ok(packet) if packet.status != StatusCode::Success => {
                        let error = MemdError::Kv(translator.to_error(&packet));
                        node_collector.finish(
                            &node,
                            SingleServerStats {
                                stats: std::mem::take(&mut stats),
                                error: Some(error),
                            },
                        );
                        true
                    }
                    // An empty key terminates the stream
                    Ok(packet) if packet.key.is_empty() => {
                        node_collector.finish(
                            &node,
                            SingleServerStats {
                                stats: std::mem::take(&mut stats),
                                error: None,
                            },
                        );
                        true
                    }
                    Ok(packet) => {
                        stats.insert(
                            String::from_utf8_lossy(&packet.key).into_owned(),
                            String::from_utf8_lossy(&packet.value).into_owned(),
                        );
                        false
                    }
                    Err(error) => {
                        node_collector.finish(
                            &node,
                            SingleServerStats {
                                stats: std::mem::take(&mut stats),
                                error: Some(error),
                            },
                        );
                        true
                    }
                }
            });

            if let Err(error) = pipeline.send(request) {
                tracing::debug!("Stats request to {} not sent: {}", address, error);
                collector.fail(&address, error);
            }
        }

        Ok(PendingOp::new(slot))
    }
}

/// Node addresses in first-seen order, each once
fn distinct_nodes(nodes: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(nodes.len());
    nodes
        .iter()
        .filter(|address| seen.insert(address.as_str()))
        .cloned()
        .collect()
}
