//! Registered-method table (C6).
//!
//! Mirrors `server.c`'s `registered_method` list plus the probe table built
//! over it in `server_start` (`channel_data.registered_methods`,
//! `GRPC_MDSTR_KV_HASH`, `channel_registered_method_lookup`). Lookup
//! identity is interned-pointer equality (`crate::interner::Interner`)
//! rather than string comparison, exactly as the original compares
//! `grpc_mdstr` pointers rather than byte contents.

use std::sync::Arc;

use crate::matcher::RequestMatcher;

/// One `(method, host)` registration and its dedicated [`RequestMatcher`].
/// `host = None` means "any host" (a wildcard registration).
pub struct RegisteredMethod {
    pub method: Arc<str>,
    pub host: Option<Arc<str>>,
    pub optional_payload: bool,
    pub matcher: RequestMatcher,
}

fn probe_hash(method: &Arc<str>, host: Option<&Arc<str>>) -> u64 {
    let method_bits = Arc::as_ptr(method) as *const () as u64;
    let host_bits = host.map(|h| Arc::as_ptr(h) as *const () as u64).unwrap_or(0);
    // Pointers from a bump/slab-style allocator are 8/16-byte aligned and
    // differ mostly in their low-order bits once shifted; a cheap multiplicative
    // mix (splitmix64's finalizer) is enough to spread them over the table.
    let mut x = method_bits ^ host_bits.rotate_left(32);
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51afd7ed558ccd);
    x ^= x >> 33;
    x
}

/// Open-addressed probe table over every `(method, host)` registration,
/// sized `2 * registrations.len()` and linearly probed, matching the
/// original's `channel_data.registered_methods` sizing.
pub struct ProbeTable {
    slots: Vec<Option<Arc<RegisteredMethod>>>,
    max_probes: usize,
}

impl ProbeTable {
    /// Build a probe table over `methods`. Panics if two entries share the
    /// same `(method, host)` identity — callers must dedupe at
    /// registration time (`crate::server::Server::register_method` rejects
    /// duplicates before this is ever called).
    pub fn build(methods: Vec<Arc<RegisteredMethod>>) -> Self {
        if methods.is_empty() {
            return Self {
                slots: Vec::new(),
                max_probes: 0,
            };
        }
        let size = (methods.len() * 2).max(1);
        let mut slots: Vec<Option<Arc<RegisteredMethod>>> = vec![None; size];
        let mut max_probes = 0usize;
        for method in methods {
            let hash = probe_hash(&method.method, method.host.as_ref());
            let mut probes = 0usize;
            let mut idx = (hash as usize) % size;
            loop {
                if slots[idx].is_none() {
                    slots[idx] = Some(method);
                    break;
                }
                probes += 1;
                idx = (idx + 1) % size;
                assert!(probes <= size, "probe table full: every slot occupied");
            }
            max_probes = max_probes.max(probes + 1);
        }
        Self { slots, max_probes }
    }

    /// Look up the exact `(path, host)` registration first, then fall back
    /// to the `(path, None)` wildcard registration, exactly as
    /// `start_new_rpc` tries `channel_registered_method_lookup` with the
    /// call's host before retrying with a null host.
    pub fn lookup(&self, method: &Arc<str>, host: Option<&Arc<str>>) -> Option<&Arc<RegisteredMethod>> {
        if self.slots.is_empty() {
            return None;
        }
        if let Some(host) = host {
            if let Some(found) = self.probe(method, Some(host)) {
                return Some(found);
            }
        }
        self.probe(method, None)
    }

    fn probe(&self, method: &Arc<str>, host: Option<&Arc<str>>) -> Option<&Arc<RegisteredMethod>> {
        let size = self.slots.len();
        let hash = probe_hash(method, host);
        let mut idx = (hash as usize) % size;
        for _ in 0..=self.max_probes {
            match &self.slots[idx] {
                Some(candidate)
                    if Arc::ptr_eq(&candidate.method, method)
                        && candidate.host.as_ref().map(Arc::as_ptr) == host.map(Arc::as_ptr) =>
                {
                    return Some(candidate);
                }
                Some(_) => idx = (idx + 1) % size,
                None => return None,
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interner::Interner;

    fn method(interner: &Interner, path: &str, host: Option<&str>) -> Arc<RegisteredMethod> {
        Arc::new(RegisteredMethod {
            method: interner.intern(path),
            host: host.map(|h| interner.intern(h)),
            optional_payload: false,
            matcher: RequestMatcher::new(16),
        })
    }

    #[test]
    fn exact_host_wins_over_wildcard() {
        let interner = Interner::new();
        let wildcard = method(&interner, "/svc/Method", None);
        let exact = method(&interner, "/svc/Method", Some("api.example.com"));
        let table = ProbeTable::build(vec![wildcard.clone(), exact.clone()]);

        let path = interner.intern("/svc/Method");
        let host = interner.intern("api.example.com");
        let found = table.lookup(&path, Some(&host)).expect("should match");
        assert!(Arc::ptr_eq(found, &exact));
    }

    #[test]
    fn falls_back_to_wildcard_for_unregistered_host() {
        let interner = Interner::new();
        let wildcard = method(&interner, "/svc/Method", None);
        let table = ProbeTable::build(vec![wildcard.clone()]);

        let path = interner.intern("/svc/Method");
        let host = interner.intern("unregistered-host");
        let found = table.lookup(&path, Some(&host)).expect("should fall back");
        assert!(Arc::ptr_eq(found, &wildcard));
    }

    #[test]
    fn unregistered_method_misses() {
        let interner = Interner::new();
        let registered = method(&interner, "/svc/Method", None);
        let table = ProbeTable::build(vec![registered]);

        let other = interner.intern("/svc/Other");
        assert!(table.lookup(&other, None).is_none());
    }

    #[test]
    fn empty_table_always_misses() {
        let table = ProbeTable::build(vec![]);
        let interner = Interner::new();
        let path = interner.intern("/svc/Method");
        assert!(table.lookup(&path, None).is_none());
    }
}
