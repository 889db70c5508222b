//! Sharded session registry.
//!
//! Sessions land in the bucket picked by `sid & (nbucket - 1)`; the table
//! doubles (up to `MAX_BUCKETS`) once any bucket outgrows `BUCKET_SPLIT`.
//! The uid index only ever holds logged-in sessions and the per-IP counter
//! only sessions that reserved a slot at login.
//!
//! Closing a session involves the writer lock, so scan operations return
//! the affected sessions for the caller to close outside the registry lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::frontend::session::{Session, SessionState};

const BUCKET_SPLIT: usize = 1024;
const MAX_BUCKETS: usize = 8;

struct Inner {
    nbucket: usize,
    buckets: Vec<HashMap<i64, Arc<Session>>>,
    uid_index: HashMap<i64, i64>,
    ip_counts: HashMap<String, usize>,
    total: usize,
}

impl Inner {
    fn bucket_of(&self, sid: i64) -> usize {
        (sid as usize) & (self.nbucket - 1)
    }

    fn grow(&mut self) {
        let nbucket = self.nbucket * 2;
        let mut buckets: Vec<HashMap<i64, Arc<Session>>> = Vec::with_capacity(nbucket);
        buckets.resize_with(nbucket, HashMap::new);
        for old in self.buckets.drain(..) {
            for (sid, s) in old {
                buckets[(sid as usize) & (nbucket - 1)].insert(sid, s);
            }
        }
        self.nbucket = nbucket;
        self.buckets = buckets;
    }
}

/// Result of a broadcast scan: sessions to write to and expired sessions to
/// close.
pub struct Scan {
    pub fresh: Vec<Arc<Session>>,
    pub stale: Vec<Arc<Session>>,
}

pub struct SessionRegistry {
    max_conns: usize,
    max_conns_per_ip: usize,
    next_sid: AtomicI64,
    clean_cursor: AtomicUsize,
    inner: RwLock<Inner>,
}

impl SessionRegistry {
    pub fn new(max_conns: usize, max_conns_per_ip: usize) -> Self {
        Self {
            max_conns,
            max_conns_per_ip,
            next_sid: AtomicI64::new(0),
            clean_cursor: AtomicUsize::new(0),
            inner: RwLock::new(Inner {
                nbucket: 1,
                buckets: vec![HashMap::new()],
                uid_index: HashMap::new(),
                ip_counts: HashMap::new(),
                total: 0,
            }),
        }
    }

    /// Monotonic session id, never reused.
    pub fn alloc_sid(&self) -> i64 {
        self.next_sid.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn size(&self) -> usize {
        self.inner.read().map(|inner| inner.total).unwrap_or(0)
    }

    /// Insert a session. Returns `(n, ok)` where `n` is the new total and
    /// `ok` is false once the table is beyond `max_conns`; the session is
    /// then marked `Overflow` but kept until it closes.
    pub fn add(&self, s: Arc<Session>) -> (usize, bool) {
        let Ok(mut guard) = self.inner.write() else { return (0, false) };
        let inner = &mut *guard;
        let idx = inner.bucket_of(s.sid);
        if inner.buckets[idx].insert(s.sid, s.clone()).is_none() {
            inner.total += 1;
        }
        if inner.buckets[idx].len() > BUCKET_SPLIT && inner.nbucket < MAX_BUCKETS {
            inner.grow();
        }
        let n = inner.total;
        let ok = self.max_conns == 0 || n <= self.max_conns;
        if !ok {
            s.set_state(SessionState::Overflow);
        }
        (n, ok)
    }

    /// Remove a session, releasing its IP slot and uid binding.
    pub fn remove(&self, sid: i64) -> Option<Arc<Session>> {
        let mut inner = self.inner.write().ok()?;
        let idx = inner.bucket_of(sid);
        let s = inner.buckets[idx].remove(&sid)?;
        inner.total -= 1;
        if s.ip_recorded() {
            let ip = s.ip();
            if let Some(n) = inner.ip_counts.get_mut(&ip) {
                if *n > 1 {
                    *n -= 1;
                } else {
                    inner.ip_counts.remove(&ip);
                }
            }
        }
        let uid = s.uid();
        if uid > 0 && inner.uid_index.get(&uid) == Some(&sid) {
            inner.uid_index.remove(&uid);
        }
        Some(s)
    }

    /// Idempotently bind `uid → sid`; fails if the uid is already bound to a
    /// different session.
    pub fn mapping(&self, uid: i64, sid: i64) -> bool {
        let Ok(mut inner) = self.inner.write() else { return false };
        match inner.uid_index.get(&uid) {
            Some(old) => *old == sid,
            None => {
                inner.uid_index.insert(uid, sid);
                true
            }
        }
    }

    pub fn get(&self, sid: i64) -> Option<Arc<Session>> {
        let inner = self.inner.read().ok()?;
        let idx = inner.bucket_of(sid);
        inner.buckets[idx].get(&sid).cloned()
    }

    pub fn find(&self, uid: i64) -> Option<Arc<Session>> {
        let inner = self.inner.read().ok()?;
        let sid = *inner.uid_index.get(&uid)?;
        let idx = inner.bucket_of(sid);
        inner.buckets[idx].get(&sid).cloned()
    }

    /// Reserve one slot for `ip`, bounded by `max_conns_per_ip` (0 means
    /// unlimited).
    pub fn record_ip(&self, ip: &str) -> bool {
        let Ok(mut inner) = self.inner.write() else { return false };
        let n = inner.ip_counts.get(ip).copied().unwrap_or(0);
        if self.max_conns_per_ip > 0 && n >= self.max_conns_per_ip {
            return false;
        }
        inner.ip_counts.insert(ip.to_string(), n + 1);
        true
    }

    pub fn ip_count(&self, ip: &str) -> usize {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.ip_counts.get(ip).copied())
            .unwrap_or(0)
    }

    /// Scan one bucket (round-robin across calls) and return the sessions
    /// past their inactivity deadline. Unauthenticated sessions use the
    /// shorter `unauth_ttl_ms`.
    pub fn clean(&self, ttl_ms: i64, unauth_ttl_ms: i64, now: i64) -> Vec<Arc<Session>> {
        let Ok(inner) = self.inner.read() else { return Vec::new() };
        let idx = self.clean_cursor.fetch_add(1, Ordering::Relaxed) % inner.nbucket;
        inner.buckets[idx]
            .values()
            .filter(|s| {
                let ttl = if s.uid() > 0 { ttl_ms } else { ttl_ms.min(unauth_ttl_ms) };
                s.last_keepalive_at() + ttl < now
            })
            .cloned()
            .collect()
    }

    /// Full scan splitting live sessions from expired ones.
    pub fn scan(&self, ttl_ms: i64, now: i64) -> Scan {
        let mut scan = Scan { fresh: Vec::new(), stale: Vec::new() };
        let Ok(inner) = self.inner.read() else { return scan };
        for bucket in &inner.buckets {
            for s in bucket.values() {
                if s.last_keepalive_at() + ttl_ms >= now {
                    scan.fresh.push(s.clone());
                } else {
                    scan.stale.push(s.clone());
                }
            }
        }
        scan
    }

    /// Sessions that still need a shutdown kick: everything not already
    /// closing, closed, or overflowed.
    pub fn shutdown_targets(&self) -> Vec<Arc<Session>> {
        let Ok(inner) = self.inner.read() else { return Vec::new() };
        inner
            .buckets
            .iter()
            .flat_map(|b| b.values())
            .filter(|s| {
                !matches!(
                    s.state(),
                    SessionState::Closing | SessionState::Closed | SessionState::Overflow
                )
            })
            .cloned()
            .collect()
    }

    pub fn logged_count(&self) -> usize {
        self.inner.read().map(|inner| inner.uid_index.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn nbucket(&self) -> usize {
        self.inner.read().map(|inner| inner.nbucket).unwrap_or(0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::frontend::limiter::MsgLimiter;
    use crate::transport::{FrameSink, Outbound};
    use async_trait::async_trait;
    use gated_core::protocol::frame::ContentType;
    use gated_core::Result;

    struct NullSink;

    #[async_trait]
    impl FrameSink for NullSink {
        async fn send(&mut self, _out: Outbound) -> Result<()> {
            Ok(())
        }
        async fn shutdown(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn session(sid: i64) -> Arc<Session> {
        Arc::new(Session::new(
            sid,
            "127.0.0.1".into(),
            ContentType::Binary,
            MsgLimiter::disabled(),
            Box::new(NullSink),
        ))
    }

    #[test]
    fn sid_allocation_is_monotonic() {
        let reg = SessionRegistry::new(0, 0);
        let a = reg.alloc_sid();
        let b = reg.alloc_sid();
        assert!(b > a);
        assert!(a > 0);
    }

    #[test]
    fn add_marks_overflow_beyond_max_conns() {
        let reg = SessionRegistry::new(2, 0);
        let (n, ok) = reg.add(session(1));
        assert!(ok && n == 1);
        let (n, ok) = reg.add(session(2));
        assert!(ok && n == 2);

        let third = session(3);
        let (n, ok) = reg.add(third.clone());
        assert!(!ok && n == 3);
        assert_eq!(third.state(), SessionState::Overflow);
    }

    #[test]
    fn mapping_is_idempotent_but_exclusive() {
        let reg = SessionRegistry::new(0, 0);
        assert!(reg.mapping(42, 7));
        assert!(reg.mapping(42, 7));
        assert!(!reg.mapping(42, 8));
    }

    #[test]
    fn remove_releases_uid_and_ip() {
        let reg = SessionRegistry::new(0, 1);
        let s = session(7);
        reg.add(s.clone());
        assert!(reg.record_ip(&s.ip()));
        s.mark_ip_recorded();
        assert!(reg.mapping(42, 7));
        s.set_user(crate::auth::Claims { uid: 42, ..Default::default() });

        // Second login from the same IP is rejected while the slot is held.
        assert!(!reg.record_ip("127.0.0.1"));

        let removed = reg.remove(7).unwrap();
        assert_eq!(removed.sid, 7);
        assert_eq!(reg.ip_count("127.0.0.1"), 0);
        assert!(reg.find(42).is_none());
        assert!(reg.mapping(42, 8));
    }

    #[test]
    fn remove_keeps_foreign_uid_binding() {
        let reg = SessionRegistry::new(0, 0);
        let old = session(7);
        old.set_user(crate::auth::Claims { uid: 42, ..Default::default() });
        reg.add(old);
        // uid 42 is bound to a different, newer session.
        assert!(reg.mapping(42, 9));
        reg.remove(7);
        assert!(!reg.mapping(42, 8));
    }

    #[test]
    fn find_resolves_through_uid_index() {
        let reg = SessionRegistry::new(0, 0);
        let s = session(7);
        reg.add(s.clone());
        assert!(reg.find(42).is_none());
        reg.mapping(42, 7);
        assert_eq!(reg.find(42).unwrap().sid, 7);
    }

    #[test]
    fn buckets_double_under_load() {
        let reg = SessionRegistry::new(0, 0);
        assert_eq!(reg.nbucket(), 1);
        for sid in 1..=(BUCKET_SPLIT as i64 + 1) {
            reg.add(session(sid));
        }
        assert_eq!(reg.nbucket(), 2);
        // Every session is still reachable after redistribution.
        for sid in 1..=(BUCKET_SPLIT as i64 + 1) {
            assert_eq!(reg.get(sid).unwrap().sid, sid);
        }
    }

    #[test]
    fn clean_rotates_and_catches_expired() {
        let reg = SessionRegistry::new(0, 0);
        let s = session(1);
        reg.add(s.clone());
        let now = s.last_keepalive_at();
        assert!(reg.clean(1000, 1000, now + 500).is_empty());
        let expired = reg.clean(1000, 1000, now + 1001);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].sid, 1);
    }

    #[test]
    fn clean_uses_short_ttl_for_unauthorized() {
        let reg = SessionRegistry::new(0, 0);
        let s = session(1);
        reg.add(s.clone());
        let now = s.last_keepalive_at();
        // Past the unauth ttl but not the logged ttl.
        assert_eq!(reg.clean(10_000, 500, now + 600).len(), 1);
        s.set_user(crate::auth::Claims { uid: 42, ..Default::default() });
        assert!(reg.clean(10_000, 500, now + 600).is_empty());
    }

    #[test]
    fn scan_splits_fresh_from_stale() {
        let reg = SessionRegistry::new(0, 0);
        let fresh = session(1);
        let stale = session(2);
        reg.add(fresh.clone());
        reg.add(stale.clone());
        let now = fresh.last_keepalive_at() + 2000;
        stale.keepalive(now - 3000);
        fresh.keepalive(now);

        let scan = reg.scan(1000, now);
        assert_eq!(scan.fresh.len(), 1);
        assert_eq!(scan.fresh[0].sid, 1);
        assert_eq!(scan.stale.len(), 1);
        assert_eq!(scan.stale[0].sid, 2);
    }
}
