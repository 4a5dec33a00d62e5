//! Backend endpoints and endpoint lists
//!
//! An endpoint travels as a plain string, either `address` or
//! `label=>address`. The label is what the registry calls the server; the
//! address is what the proxies connect to.

use std::fmt;

/// Separator between an endpoint's label and its address
pub const LABEL_SEPARATOR: &str = "=>";

/// A single backend address, optionally labeled
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Build the `label=>address` form
    pub fn labeled(label: &str, addr: &str) -> Self {
        Self(format!("{}{}{}", label, LABEL_SEPARATOR, addr))
    }

    /// The label, or the address when the endpoint is unlabeled
    pub fn name(&self) -> &str {
        match self.0.split_once(LABEL_SEPARATOR) {
            Some((label, _)) => label,
            None => &self.0,
        }
    }

    /// The bare address, without any label
    pub fn addr(&self) -> &str {
        match self.0.split_once(LABEL_SEPARATOR) {
            Some((_, addr)) => addr,
            None => &self.0,
        }
    }

    /// The address with an `http://` scheme unless it already carries one
    pub fn http_addr(&self) -> String {
        let addr = self.addr();
        if addr.contains("://") {
            addr.to_string()
        } else {
            format!("http://{}", addr)
        }
    }

    /// The address with any scheme prefix removed, suitable for a URI authority
    pub fn authority(&self) -> &str {
        let addr = self.addr();
        let addr = addr.split_once("://").map(|(_, rest)| rest).unwrap_or(addr);
        addr.trim_end_matches('/')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Endpoint {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for Endpoint {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

/// Ordered collection of endpoints forming one backend group
///
/// Duplicates are allowed; round robin picks a duplicated address
/// proportionally more often.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointList {
    endpoints: Vec<Endpoint>,
}

impl EndpointList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append endpoints in order
    pub fn add<S: AsRef<str>>(&mut self, endpoints: &[S]) {
        self.endpoints
            .extend(endpoints.iter().map(|e| Endpoint::new(e.as_ref())));
    }

    /// Remove every endpoint whose raw value matches one of `endpoints`
    pub fn delete<S: AsRef<str>>(&mut self, endpoints: &[S]) {
        self.endpoints
            .retain(|e| !endpoints.iter().any(|d| d.as_ref() == e.as_str()));
    }

    /// Endpoint at position `index`
    pub fn select(&self, index: usize) -> Option<&Endpoint> {
        self.endpoints.get(index)
    }

    /// Whether any endpoint has the given address (labels are ignored)
    pub fn has_endpoint(&self, addr: &str) -> bool {
        self.endpoints.iter().any(|e| e.addr() == addr)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter()
    }

    /// Raw string form of every endpoint, in order
    pub fn to_strings(&self) -> Vec<String> {
        self.endpoints.iter().map(|e| e.to_string()).collect()
    }
}

impl FromIterator<Endpoint> for EndpointList {
    fn from_iter<I: IntoIterator<Item = Endpoint>>(iter: I) -> Self {
        Self {
            endpoints: iter.into_iter().collect(),
        }
    }
}

/// Build an endpoint list from raw strings
pub fn create_endpoints<S: AsRef<str>>(endpoints: &[S]) -> EndpointList {
    let mut list = EndpointList::new();
    list.add(endpoints);
    list
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labeled_endpoint() {
        let endpoint = Endpoint::new("api=>10.0.0.1:9000");
        assert_eq!(endpoint.name(), "api");
        assert_eq!(endpoint.addr(), "10.0.0.1:9000");
        assert_eq!(endpoint.http_addr(), "http://10.0.0.1:9000");
    }

    #[test]
    fn test_unlabeled_endpoint() {
        let endpoint = Endpoint::new("10.0.0.1:9000");
        assert_eq!(endpoint.name(), "10.0.0.1:9000");
        assert_eq!(endpoint.addr(), "10.0.0.1:9000");
        assert_eq!(endpoint.http_addr(), "http://10.0.0.1:9000");
    }

    #[test]
    fn test_http_addr_keeps_existing_scheme() {
        let endpoint = Endpoint::new("node=>https://rbd-node:6100");
        assert_eq!(endpoint.http_addr(), "https://rbd-node:6100");
        assert_eq!(endpoint.authority(), "rbd-node:6100");
    }

    #[test]
    fn test_labeled_constructor() {
        let endpoint = Endpoint::labeled("builder", "10.0.0.2:3333");
        assert_eq!(endpoint.as_str(), "builder=>10.0.0.2:3333");
        assert_eq!(endpoint.name(), "builder");
    }

    #[test]
    fn test_list_add_delete() {
        let mut list = create_endpoints(&["10.0.0.1:80", "10.0.0.2:80"]);
        list.add(&["10.0.0.3:80"]);
        assert_eq!(list.len(), 3);

        list.delete(&["10.0.0.2:80"]);
        assert_eq!(list.len(), 2);
        assert!(!list.has_endpoint("10.0.0.2:80"));
        assert_eq!(list.select(1).map(|e| e.addr()), Some("10.0.0.3:80"));
        assert!(list.select(2).is_none());
    }

    #[test]
    fn test_duplicates_are_kept() {
        let list = create_endpoints(&["10.0.0.1:80", "10.0.0.1:80"]);
        assert_eq!(list.len(), 2);

        let mut list = list;
        list.delete(&["10.0.0.1:80"]);
        assert!(list.is_empty());
    }

    #[test]
    fn test_has_endpoint_ignores_label() {
        let list = create_endpoints(&["a=>10.0.0.1:80"]);
        assert!(list.has_endpoint("10.0.0.1:80"));
        assert!(!list.has_endpoint("a"));
    }
}
