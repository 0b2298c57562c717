//! Create-once dialer registry and release-once shared dialers

use super::{DialerFactory, DialerFamily, DialerOptions, InstanceName, TunnelDialer, TunnelStream};

use crate::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;

type Slot = OnceCell<std::result::Result<Arc<SharedDialer>, String>>;

// High bit of the lease word: a release has begun and no new lease may start.
const RETIRING: usize = 1 << (usize::BITS - 1);

/// Holds at most one dialer per family for the lifetime of the registry.
///
/// Creation runs behind a [`OnceCell`]: concurrent first callers wait on a
/// single factory call and all observe its outcome. A failed creation is
/// cached and returned to every later caller.
///
/// One registry is normally shared by the whole process (see
/// [`Connector::with_dialers`](crate::Connector::with_dialers)).
pub struct DialerRegistry {
    factory: Arc<dyn DialerFactory>,
    postgres: Slot,
    mysql: Slot,
}

impl DialerRegistry {
    /// Create a registry backed by `factory`
    pub fn new(factory: impl DialerFactory + 'static) -> Self {
        Self::with_factory(Arc::new(factory))
    }

    /// Create a registry backed by a shared factory
    pub fn with_factory(factory: Arc<dyn DialerFactory>) -> Self {
        Self {
            factory,
            postgres: OnceCell::new(),
            mysql: OnceCell::new(),
        }
    }

    fn slot(&self, family: DialerFamily) -> &Slot {
        match family {
            DialerFamily::Postgres => &self.postgres,
            DialerFamily::MySql => &self.mysql,
        }
    }

    /// Shared dialer for `family`, created on first use.
    ///
    /// `options` only matter to the call that performs the creation.
    pub async fn dialer(
        &self,
        family: DialerFamily,
        options: &DialerOptions,
    ) -> Result<Arc<SharedDialer>> {
        let created = self
            .slot(family)
            .get_or_init(|| async {
                match self.factory.create(family, options).await {
                    Ok(dialer) => {
                        crate::metrics::counters::dialer_created(family.as_str());
                        tracing::info!(
                            family = family.as_str(),
                            routing = options.routing(),
                            managed_auth = options.managed_auth,
                            "tunnel dialer created"
                        );
                        Ok(Arc::new(SharedDialer::new(family, dialer)))
                    }
                    Err(e) => {
                        tracing::warn!(family = family.as_str(), error = %e, "tunnel dialer creation failed");
                        Err(e.to_string())
                    }
                }
            })
            .await;

        match created {
            Ok(shared) => Ok(shared.clone()),
            Err(msg) => Err(Error::Dial(format!("create {} dialer: {}", family, msg))),
        }
    }

    /// Already-created dialer for `family`, if any
    pub fn get(&self, family: DialerFamily) -> Option<Arc<SharedDialer>> {
        self.slot(family)
            .get()
            .and_then(|created| created.as_ref().ok())
            .cloned()
    }

    /// Release every created dialer (process-wide cleanup).
    ///
    /// Dialers already released by their last handle are skipped.
    pub async fn shutdown(&self) -> Result<()> {
        let mut errors = Vec::new();
        for family in [DialerFamily::Postgres, DialerFamily::MySql] {
            if let Some(shared) = self.get(family) {
                if let Err(e) = shared.release().await {
                    errors.push(e);
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Close(errors))
        }
    }
}

impl std::fmt::Debug for DialerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialerRegistry")
            .field("postgres", &self.postgres.initialized())
            .field("mysql", &self.mysql.initialized())
            .finish()
    }
}

/// A dialer shared by every connection of one family.
///
/// Each connection holds a [`DialerLease`]. The dialer is released exactly
/// once: when the last lease is released, or by [`DialerRegistry::shutdown`].
/// Once either begins, [`lease`](Self::lease) is refused even if the release
/// has not finished yet.
pub struct SharedDialer {
    family: DialerFamily,
    dialer: Arc<dyn TunnelDialer>,
    leases: AtomicUsize,
    released: OnceCell<std::result::Result<(), String>>,
}

impl SharedDialer {
    fn new(family: DialerFamily, dialer: Arc<dyn TunnelDialer>) -> Self {
        Self {
            family,
            dialer,
            leases: AtomicUsize::new(0),
            released: OnceCell::new(),
        }
    }

    /// Family this dialer serves
    pub fn family(&self) -> DialerFamily {
        self.family
    }

    /// Number of live leases
    pub fn lease_count(&self) -> usize {
        self.leases.load(Ordering::Acquire) & !RETIRING
    }

    fn retiring(&self) -> bool {
        self.leases.load(Ordering::Acquire) & RETIRING != 0
    }

    fn released_error(&self) -> Error {
        Error::DialerReleased {
            family: self.family.as_str(),
        }
    }

    /// Has the dialer been released?
    pub fn is_released(&self) -> bool {
        self.released.initialized()
    }

    /// Open a tunnel through the shared dialer
    pub async fn dial(&self, instance: &InstanceName) -> Result<TunnelStream> {
        if self.retiring() || self.is_released() {
            return Err(self.released_error());
        }
        self.dialer.dial(instance).await
    }

    /// Register a new user of this dialer.
    ///
    /// Fails with [`Error::DialerReleased`] once a release has begun.
    pub fn lease(self: &Arc<Self>) -> Result<DialerLease> {
        let mut current = self.leases.load(Ordering::Acquire);
        loop {
            if current & RETIRING != 0 {
                return Err(self.released_error());
            }
            match self.leases.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        Ok(DialerLease {
            shared: Arc::clone(self),
            settled: false,
        })
    }

    /// Release the dialer. Only the first call does any work; later calls return `Ok(())`.
    pub async fn release(&self) -> Result<()> {
        self.leases.fetch_or(RETIRING, Ordering::AcqRel);
        let mut first = false;
        let outcome = self
            .released
            .get_or_init(|| {
                first = true;
                async {
                    let result = self.dialer.close().await.map_err(|e| e.to_string());
                    crate::metrics::counters::dialer_released(self.family.as_str());
                    tracing::info!(family = self.family.as_str(), "tunnel dialer released");
                    result
                }
            })
            .await;

        match outcome {
            Err(msg) if first => Err(Error::Dial(format!(
                "release {} dialer: {}",
                self.family, msg
            ))),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for SharedDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDialer")
            .field("family", &self.family)
            .field("leases", &self.lease_count())
            .field("released", &self.is_released())
            .finish()
    }
}

/// One connection's claim on a [`SharedDialer`].
///
/// Dropping a lease gives up the claim without releasing the dialer; only
/// [`DialerLease::release`] on the last lease releases it.
pub struct DialerLease {
    shared: Arc<SharedDialer>,
    settled: bool,
}

impl DialerLease {
    /// The dialer this lease is on
    pub fn dialer(&self) -> &Arc<SharedDialer> {
        &self.shared
    }

    /// Give up the claim, releasing the dialer if this was the last lease
    pub async fn release(mut self) -> Result<()> {
        self.settled = true;
        let leases = &self.shared.leases;
        let mut current = leases.load(Ordering::Acquire);
        // The last lease swaps the count to RETIRING in the same step, so no
        // lease can slip in between the decrement and the release.
        let remaining = loop {
            let count = current & !RETIRING;
            let next = if count == 1 { RETIRING } else { current - 1 };
            match leases.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break count - 1,
                Err(actual) => current = actual,
            }
        };
        if remaining == 0 {
            self.shared.release().await
        } else {
            tracing::debug!(
                family = self.shared.family.as_str(),
                remaining, "dialer still in use"
            );
            Ok(())
        }
    }
}

impl Drop for DialerLease {
    fn drop(&mut self) {
        if !self.settled {
            self.shared.leases.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
