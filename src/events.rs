//! Static cross-device event graph.
//!
//! Built once from the link configuration; a named condition raised on a
//! source board requests a dump on each linked target board.
use std::collections::HashMap;

use crate::config::LinkConfig;
use crate::scheduler::{DumpHandle, DumpRequest};

#[derive(Debug, Default)]
pub struct EventRouter {
    routes: HashMap<(String, String), Vec<DumpHandle>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve every link against the known boards. Unknown names are
    /// logged here once and the link (or target) is skipped.
    pub fn build(links: &[LinkConfig], boards: &HashMap<String, DumpHandle>) -> Self {
        let mut router = Self::new();
        for link in links {
            if !boards.contains_key(&link.src) {
                log::warn!("Link source {} not found, skipping {}", link.src, link.src_type);
                continue;
            }
            for dst in &link.dst {
                match boards.get(dst) {
                    Some(handle) => {
                        log::info!("{}({}) -> {}({})", link.src, link.src_type, dst, link.dst_type);
                        router.subscribe(&link.src, &link.src_type, handle.clone());
                    }
                    None => log::warn!("Link target {} not found, skipping", dst),
                }
            }
        }
        router
    }

    pub fn subscribe(&mut self, source: &str, event_type: &str, target: DumpHandle) {
        self.routes
            .entry((source.to_string(), event_type.to_string()))
            .or_default()
            .push(target);
    }

    /// Fire `event_type` from `source`. Runs inline on the caller; targets
    /// only enqueue. Returns how many targets queued a dump.
    pub fn fire(&self, source: &str, event_type: &str, reason: &str) -> usize {
        let Some(targets) = self.routes.get(&(source.to_string(), event_type.to_string())) else {
            return 0;
        };
        targets
            .iter()
            .filter(|t| t.request(reason) == DumpRequest::Queued)
            .count()
    }

    pub fn targets(&self, source: &str, event_type: &str) -> Vec<&str> {
        self.routes
            .get(&(source.to_string(), event_type.to_string()))
            .map(|ts| ts.iter().map(|t| t.device()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::DUMP_MIN_INTERVAL;

    fn link(src: &str, src_type: &str, dst: &[&str]) -> LinkConfig {
        LinkConfig {
            src: src.into(),
            src_type: src_type.into(),
            dst: dst.iter().map(|d| d.to_string()).collect(),
            dst_type: "stat_dump".into(),
        }
    }

    #[tokio::test]
    async fn test_build_skips_unknown_names() {
        let (a, _rx_a) = DumpHandle::new("a", DUMP_MIN_INTERVAL);
        let (b, _rx_b) = DumpHandle::new("b", DUMP_MIN_INTERVAL);
        let boards: HashMap<_, _> = [("a".to_string(), a), ("b".to_string(), b)].into_iter().collect();

        let links = vec![
            link("a", "error_tag_1", &["b", "ghost"]),
            link("ghost", "warning", &["a"]),
            link("b", "warning", &["a", "b"]),
        ];
        let router = EventRouter::build(&links, &boards);

        assert_eq!(router.len(), 3);
        assert_eq!(router.targets("a", "error_tag_1"), vec!["b"]);
        assert!(router.targets("ghost", "warning").is_empty());
        assert_eq!(router.targets("b", "warning"), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_fire_enqueues_on_targets() {
        let (b, mut rx_b) = DumpHandle::new("b", DUMP_MIN_INTERVAL);
        b.set_connected(true);
        let mut router = EventRouter::new();
        router.subscribe("a", "error_tag_1", b.clone());

        assert_eq!(router.fire("a", "error_tag_1", "a:tag_1 num_1s_miss (1.2000)"), 1);
        assert_eq!(rx_b.recv().await.as_deref(), Some("a:tag_1 num_1s_miss (1.2000)"));

        // Still in flight on b, so the second firing is skipped
        assert_eq!(router.fire("a", "error_tag_1", "again"), 0);
        assert_eq!(router.fire("a", "warning", "nobody listens"), 0);
    }
}
