//! Connectivity checks for operators.

use graphloom_db::PipelineStore;
use graphloom_graph::GraphClient;
use graphloom_kv::QueueBroker;
use graphloom_protocol::QueueName;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct DoctorReport {
    pub database_ok: bool,
    pub kv_ok: bool,
    pub graph_ok: bool,
}

impl DoctorReport {
    pub fn healthy(&self) -> bool {
        self.database_ok && self.kv_ok && self.graph_ok
    }
}

/// Round-trip each backing service once.
pub async fn run_checks(
    store: &PipelineStore,
    broker: &QueueBroker,
    graph: &Arc<dyn GraphClient>,
) -> DoctorReport {
    let database_ok = match store.fetch_document("connectivity-probe").await {
        Ok(_) => true,
        Err(err) => {
            warn!(%err, "database check failed");
            false
        }
    };

    let kv_ok = match broker.queue_len(QueueName::Extraction).await {
        Ok(_) => true,
        Err(err) => {
            warn!(%err, "kv check failed");
            false
        }
    };

    let graph_ok = match graph.search("test", 1, &[]).await {
        Ok(_) => true,
        Err(err) => {
            warn!(%err, "graph engine check failed");
            false
        }
    };

    DoctorReport {
        database_ok,
        kv_ok,
        graph_ok,
    }
}
