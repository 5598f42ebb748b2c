//! Record accounting.
//!
//! A [`UsageGauge`] counts records that are currently held somewhere in a
//! pipeline. Every record admitted against a gauge carries a [`Lease`] link
//! to it; dropping the record releases one unit on every linked gauge. This
//! lets a gauge observe usage "anywhere downstream" (stage queues, batch
//! buffers, trace buffers, exporter queues, in-flight exports) without any
//! stage reporting back explicitly.
//!
//! Bounded gauges implement the memory limiter's hysteresis: once usage
//! reaches `limit` the gauge trips and refuses admission until usage falls
//! to or below `release_threshold`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy)]
struct Limits {
    limit: u64,
    release_threshold: u64,
}

pub struct UsageGauge {
    usage: AtomicU64,
    limits: Option<Limits>,
    tripped: AtomicBool,
    released: Notify,
}

impl UsageGauge {
    /// A gauge that only counts.
    pub fn unbounded() -> Arc<Self> {
        Arc::new(Self {
            usage: AtomicU64::new(0),
            limits: None,
            tripped: AtomicBool::new(false),
            released: Notify::new(),
        })
    }

    /// A gauge that refuses admission between tripping at `limit` and
    /// recovering at `release_threshold`.
    pub fn bounded(limit: u64, release_threshold: u64) -> Arc<Self> {
        debug_assert!(release_threshold < limit);
        Arc::new(Self {
            usage: AtomicU64::new(0),
            limits: Some(Limits {
                limit,
                release_threshold,
            }),
            tripped: AtomicBool::new(false),
            released: Notify::new(),
        })
    }

    pub fn usage(&self) -> u64 {
        self.usage.load(Ordering::Acquire)
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> Option<u64> {
        self.limits.map(|l| l.limit)
    }

    /// Unconditionally accounts for `units` records.
    pub(crate) fn add(&self, units: u64) {
        self.usage.fetch_add(units, Ordering::AcqRel);
    }

    /// Admits one record if the gauge is below its limit and not tripped.
    pub fn try_admit(&self) -> bool {
        let Some(limits) = self.limits else {
            self.add(1);
            return true;
        };
        if self.is_tripped() {
            return false;
        }

        let mut current = self.usage.load(Ordering::Acquire);
        loop {
            if current >= limits.limit {
                self.trip(limits);
                return false;
            }
            match self.usage.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if current + 1 >= limits.limit {
                        self.trip(limits);
                    }
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn trip(&self, limits: Limits) {
        self.tripped.store(true, Ordering::Release);
        // Releases may have drained usage between the check and the store.
        if self.usage() <= limits.release_threshold {
            self.clear_trip();
        }
    }

    fn clear_trip(&self) {
        if self.tripped.swap(false, Ordering::AcqRel) {
            self.released.notify_waiters();
        }
    }

    pub(crate) fn release(&self, units: u64) {
        let previous = self.usage.fetch_sub(units, Ordering::AcqRel);
        debug_assert!(previous >= units, "gauge released more than it admitted");
        if let Some(limits) = self.limits {
            if previous.saturating_sub(units) <= limits.release_threshold {
                self.clear_trip();
            }
        }
    }

    /// Completes once the gauge is no longer tripped.
    pub async fn wait_released(&self) {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_tripped() {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for UsageGauge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsageGauge")
            .field("usage", &self.usage())
            .field("limit", &self.limit())
            .field("tripped", &self.is_tripped())
            .finish()
    }
}

struct LeaseLink {
    gauge: Arc<UsageGauge>,
    next: Option<Arc<LeaseLink>>,
}

/// Per-record chain of gauges the record has been admitted against.
///
/// Links are shared between records that were admitted together, so a
/// batch admission allocates one link rather than one per record.
#[derive(Default)]
pub struct Lease {
    head: Option<Arc<LeaseLink>>,
}

impl Lease {
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn holds(&self, gauge: &Arc<UsageGauge>) -> bool {
        let mut link = self.head.as_deref();
        while let Some(l) = link {
            if Arc::ptr_eq(&l.gauge, gauge) {
                return true;
            }
            link = l.next.as_deref();
        }
        false
    }
}

/// Clones are not admitted anywhere; only the original releases usage.
impl Clone for Lease {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut link = self.head.as_deref();
        while let Some(l) = link {
            l.gauge.release(1);
            link = l.next.as_deref();
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut depth = 0;
        let mut link = self.head.as_deref();
        while let Some(l) = link {
            depth += 1;
            link = l.next.as_deref();
        }
        write!(f, "Lease({depth})")
    }
}

/// Links leases to one gauge, reusing the new link for consecutive leases
/// that share the same previous chain. The caller accounts the units.
pub(crate) struct LeaseAttacher {
    gauge: Arc<UsageGauge>,
    last: Option<(Option<Arc<LeaseLink>>, Arc<LeaseLink>)>,
}

impl LeaseAttacher {
    pub(crate) fn new(gauge: &Arc<UsageGauge>) -> Self {
        Self {
            gauge: Arc::clone(gauge),
            last: None,
        }
    }

    pub(crate) fn attach(&mut self, lease: &mut Lease) {
        let previous = lease.head.take();
        if let Some((shared_previous, link)) = &self.last {
            if same_chain(shared_previous, &previous) {
                lease.head = Some(Arc::clone(link));
                return;
            }
        }
        let link = Arc::new(LeaseLink {
            gauge: Arc::clone(&self.gauge),
            next: previous.clone(),
        });
        lease.head = Some(Arc::clone(&link));
        self.last = Some((previous, link));
    }
}

fn same_chain(a: &Option<Arc<LeaseLink>>, b: &Option<Arc<LeaseLink>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_hysteresis_holds_until_release_threshold() {
        let gauge = UsageGauge::bounded(10, 5);
        for _ in 0..10 {
            assert!(gauge.try_admit());
        }
        assert!(gauge.is_tripped());
        assert!(!gauge.try_admit());
        assert_eq!(gauge.usage(), 10);

        // Below the limit but above the release threshold: still refusing.
        gauge.release(3);
        assert_eq!(gauge.usage(), 7);
        assert!(!gauge.try_admit());

        // At the release threshold admission resumes.
        gauge.release(2);
        assert!(!gauge.is_tripped());
        assert!(gauge.try_admit());
        assert_eq!(gauge.usage(), 6);
    }

    #[test]
    fn test_usage_never_exceeds_limit() {
        let gauge = UsageGauge::bounded(3, 1);
        let admitted = (0..100).filter(|_| gauge.try_admit()).count();
        assert_eq!(admitted, 3);
        assert!(gauge.usage() <= 3);
    }

    #[test]
    fn test_lease_releases_every_linked_gauge_on_drop() {
        let pipeline = UsageGauge::unbounded();
        let limiter = UsageGauge::bounded(100, 10);
        let mut leases: Vec<Lease> = (0..4).map(|_| Lease::default()).collect();

        pipeline.add(4);
        let mut attacher = LeaseAttacher::new(&pipeline);
        for lease in &mut leases {
            attacher.attach(lease);
        }
        let mut attacher = LeaseAttacher::new(&limiter);
        for lease in &mut leases {
            assert!(limiter.try_admit());
            attacher.attach(lease);
        }
        assert!(leases[0].holds(&pipeline) && leases[0].holds(&limiter));
        assert_eq!(pipeline.usage(), 4);
        assert_eq!(limiter.usage(), 4);

        leases.truncate(1);
        assert_eq!(pipeline.usage(), 1);
        assert_eq!(limiter.usage(), 1);

        // Clones are unaccounted.
        let clone = leases[0].clone();
        assert!(clone.is_empty());
        drop(leases);
        drop(clone);
        assert_eq!(pipeline.usage(), 0);
        assert_eq!(limiter.usage(), 0);
    }

    #[tokio::test]
    async fn test_wait_released_wakes_on_recovery() {
        let gauge = UsageGauge::bounded(2, 0);
        assert!(gauge.try_admit());
        assert!(gauge.try_admit());
        assert!(gauge.is_tripped());

        let waiter = {
            let gauge = Arc::clone(&gauge);
            tokio::spawn(async move { gauge.wait_released().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        gauge.release(2);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[test]
    fn test_concurrent_admission_never_exceeds_limit() {
        let gauge = UsageGauge::bounded(16, 4);
        let admitted = AtomicU64::new(0);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for i in 0..10_000u32 {
                        if gauge.try_admit() {
                            assert!(gauge.usage() <= 16);
                            admitted.fetch_add(1, Ordering::Relaxed);
                            if i % 3 != 0 {
                                std::thread::yield_now();
                            }
                            gauge.release(1);
                        }
                    }
                });
            }
        });
        assert!(admitted.load(Ordering::Relaxed) > 0);
        assert_eq!(gauge.usage(), 0);
        assert!(!gauge.is_tripped());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Admit,
        Release(u64),
    }

    fn ops() -> impl Strategy<Value = Vec<Op>> {
        prop::collection::vec(
            prop_oneof![3 => Just(Op::Admit), 1 => (1u64..8).prop_map(Op::Release)],
            0..200,
        )
    }

    proptest! {
        #[test]
        fn prop_hysteresis_matches_trip_and_clear_rule(
            (limit, release_threshold) in (1u64..64).prop_flat_map(|limit| (Just(limit), 0..limit)),
            ops in ops(),
        ) {
            let gauge = UsageGauge::bounded(limit, release_threshold);
            let mut usage = 0u64;
            let mut tripped = false;

            for op in ops {
                match op {
                    Op::Admit => {
                        let expected = !tripped && usage < limit;
                        prop_assert_eq!(gauge.try_admit(), expected);
                        if expected {
                            usage += 1;
                            tripped |= usage == limit;
                        }
                    }
                    Op::Release(n) => {
                        let n = n.min(usage);
                        if n == 0 {
                            continue;
                        }
                        gauge.release(n);
                        usage -= n;
                        if usage <= release_threshold {
                            tripped = false;
                        }
                    }
                }
                prop_assert!(gauge.usage() <= limit);
                prop_assert_eq!(gauge.usage(), usage);
                prop_assert_eq!(gauge.is_tripped(), tripped);
            }
        }
    }
}
