// Known-address manager: time-stamped set fed by gossip and seeds

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

#[derive(Default)]
pub struct AddrManager {
    known: Mutex<HashMap<String, SystemTime>>,
}

impl AddrManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an address; returns true when it was new.
    pub fn add(&self, addr: &str) -> bool {
        let mut known = self.known.lock().expect("addr manager lock");
        known.insert(addr.to_string(), SystemTime::now()).is_none()
    }

    pub fn add_many(&self, addrs: &[String]) -> usize {
        addrs.iter().filter(|a| self.add(a)).count()
    }

    pub fn get_some(&self, n: usize) -> Vec<String> {
        let known = self.known.lock().expect("addr manager lock");
        known.keys().take(n).cloned().collect()
    }

    pub fn get_all(&self) -> Vec<String> {
        let known = self.known.lock().expect("addr manager lock");
        known.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.known.lock().expect("addr manager lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_reports_novelty() {
        let mgr = AddrManager::new();
        assert!(mgr.add("10.0.0.1:9001"));
        assert!(!mgr.add("10.0.0.1:9001"));
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn test_get_some_caps_count() {
        let mgr = AddrManager::new();
        for i in 0..5 {
            mgr.add(&format!("10.0.0.{}:9001", i));
        }
        assert_eq!(mgr.get_some(3).len(), 3);
        assert_eq!(mgr.get_all().len(), 5);
    }
}
