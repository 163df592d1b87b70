//! Local interface inventory (name, mac, ip, type)

use super::{Collector, CollectorContext};
use crate::discovery::NetworkInfo;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;

pub struct InterfacesCollector;

impl Collector for InterfacesCollector {
    fn kind(&self) -> &'static str {
        "interfaces"
    }

    fn run<'a>(&'a self, ctx: &'a CollectorContext) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            let interfaces = NetworkInfo::enumerate()?;
            ctx.put("interfaces", json!({ "interfaces": interfaces }))?;
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_interfaces_entry_queued() {
        let store = Arc::new(QueueStore::open_in_memory().unwrap());
        let ctx = CollectorContext::new("interfaces", toml::Table::new(), store.clone());

        InterfacesCollector.run(&ctx).await.unwrap();

        let entries = store.peek(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_type, "interfaces");
        assert!(entries[0].payload["interfaces"].is_array());
    }
}
