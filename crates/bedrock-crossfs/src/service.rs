//! Translated service definitions, memoized per backing file.
//!
//! When a stratum ships a runit-style service directory and the init
//! stratum runs systemd, a unit file is synthesized on the fly that drives
//! the service's `run` script through strat.  Generation is cheap but not
//! free, so results are cached keyed by the backing file's absolute path
//! and invalidated when its modification time changes.

use std::collections::HashMap;
use std::sync::Mutex;

use bedrock_core::STRAT_PATH;

/// Service manager style of the init stratum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    Systemd,
}

struct GeneratedService {
    text: Vec<u8>,
    mtime: i64,
}

#[derive(Default)]
pub struct ServiceCache {
    // Mutated from read-path handlers; serialized independently of the
    // config lock.
    inner: Mutex<HashMap<String, GeneratedService>>,
}

impl ServiceCache {
    pub fn new() -> ServiceCache {
        ServiceCache::default()
    }

    /// The synthesized unit text for a runit-style service at
    /// `full_path` (absolute, stratum-qualified) owned by `stratum`.
    pub fn unit_for(&self, full_path: &str, stratum: &str, mtime: i64) -> Vec<u8> {
        let mut cache = self.inner.lock().unwrap();
        if let Some(hit) = cache.get(full_path) {
            if hit.mtime == mtime {
                return hit.text.clone();
            }
        }
        let text = render_systemd_unit(stratum, full_path);
        let entry = GeneratedService {
            text: text.clone(),
            mtime,
        };
        cache.insert(full_path.to_string(), entry);
        text
    }
}

fn render_systemd_unit(stratum: &str, full_path: &str) -> Vec<u8> {
    format!("[Service]\nExecStart={STRAT_PATH} -r {stratum} {full_path}/run\n").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_invokes_run_script_through_strat() {
        let cache = ServiceCache::new();
        let text = cache.unit_for("/bedrock/strata/void/etc/sv/sshd", "void", 10);
        assert_eq!(
            text,
            b"[Service]\nExecStart=/bedrock/bin/strat -r void /bedrock/strata/void/etc/sv/sshd/run\n"
        );
    }

    #[test]
    fn cache_hits_on_same_mtime_and_invalidates_on_change() {
        let cache = ServiceCache::new();
        let first = cache.unit_for("/bedrock/strata/void/etc/sv/sshd", "void", 10);
        let again = cache.unit_for("/bedrock/strata/void/etc/sv/sshd", "void", 10);
        assert_eq!(first, again);
        let refreshed = cache.unit_for("/bedrock/strata/void/etc/sv/sshd", "void", 11);
        assert_eq!(first, refreshed);
        assert_eq!(cache.inner.lock().unwrap().len(), 1);
    }
}
