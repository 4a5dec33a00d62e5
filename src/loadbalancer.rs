//! Endpoint selection policies
//!
//! Proxies consult a [`LoadBalance`] implementation on every request to pick
//! one endpoint out of their current list. Round robin is the only policy.

use crate::endpoint::{Endpoint, EndpointList};
use crate::error::NoUpstream;
use crate::proxy::ProxyBody;
use hyper::Request;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Selection policy over an endpoint list
pub trait LoadBalance: Send + Sync + std::fmt::Debug {
    /// Pick one endpoint for `req`, or fail with [`NoUpstream`] when the list is empty
    fn select(&self, req: &Request<ProxyBody>, endpoints: &EndpointList)
        -> Result<Endpoint, NoUpstream>;
}

/// Round-robin: distribute requests evenly in order
///
/// The counter is shared by every caller and only ever grows; the list length
/// is read on each call, so a list replaced between two selections simply
/// changes the modulus.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalance for RoundRobin {
    fn select(
        &self,
        _req: &Request<ProxyBody>,
        endpoints: &EndpointList,
    ) -> Result<Endpoint, NoUpstream> {
        if endpoints.is_empty() {
            return Err(NoUpstream);
        }

        let index = self.counter.fetch_add(1, Ordering::Relaxed) % endpoints.len();
        let endpoint = endpoints.select(index).cloned().ok_or(NoUpstream)?;
        debug!(index, endpoint = %endpoint, total = endpoints.len(), "Selected endpoint");
        Ok(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::create_endpoints;
    use crate::proxy::empty_body;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn request() -> Request<ProxyBody> {
        Request::new(empty_body())
    }

    #[test]
    fn test_round_robin_cycles() {
        let lb = RoundRobin::new();
        let list = create_endpoints(&["a:1", "b:2", "c:3"]);
        let req = request();

        let picked: Vec<String> = (0..4)
            .map(|_| lb.select(&req, &list).unwrap().addr().to_string())
            .collect();
        assert_eq!(picked, vec!["a:1", "b:2", "c:3", "a:1"]);
    }

    #[test]
    fn test_round_robin_fairness() {
        let lb = RoundRobin::new();
        let list = create_endpoints(&["a:1", "b:2", "c:3", "d:4"]);
        let req = request();

        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut previous: Option<usize> = None;
        for _ in 0..400 {
            let endpoint = lb.select(&req, &list).unwrap();
            let index = list.iter().position(|e| *e == endpoint).unwrap();
            if let Some(prev) = previous {
                assert_eq!(index, (prev + 1) % list.len());
            }
            previous = Some(index);
            *counts.entry(endpoint.addr().to_string()).or_default() += 1;
        }

        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|&c| c == 100));
    }

    #[test]
    fn test_empty_list_is_no_upstream() {
        let lb = RoundRobin::new();
        let list = EndpointList::new();
        assert_eq!(lb.select(&request(), &list), Err(NoUpstream));
    }

    #[test]
    fn test_duplicates_selected_proportionally() {
        let lb = RoundRobin::new();
        let list = create_endpoints(&["a:1", "a:1", "b:2"]);
        let req = request();

        let a = (0..30)
            .filter(|_| lb.select(&req, &list).unwrap().addr() == "a:1")
            .count();
        assert_eq!(a, 20);
    }

    #[test]
    fn test_concurrent_selection_is_fair() {
        let lb = Arc::new(RoundRobin::new());
        let list = Arc::new(create_endpoints(&["a:1", "b:2"]));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lb = Arc::clone(&lb);
                let list = Arc::clone(&list);
                std::thread::spawn(move || {
                    let req = request();
                    (0..250)
                        .filter(|_| lb.select(&req, &list).unwrap().addr() == "a:1")
                        .count()
                })
            })
            .collect();

        let a: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(a, 500);
    }
}
