//! Leak-prevention routes
//!
//! Four reject routes partition the IPv4 space into /2 blocks. They are more
//! specific than any default route, so while they exist nothing leaves
//! outside the tunnel; the tunnel's own pushed routes are narrower still.

use crate::platform::{HOST_MASK, PlatformError, RouteManager, RouteTarget};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, warn};

pub const REJECT_MASK: Ipv4Addr = Ipv4Addr::new(192, 0, 0, 0);

pub const REJECT_NETS: [Ipv4Addr; 4] = [
    Ipv4Addr::new(0, 0, 0, 0),
    Ipv4Addr::new(64, 0, 0, 0),
    Ipv4Addr::new(128, 0, 0, 0),
    Ipv4Addr::new(192, 0, 0, 0),
];

/// Installs and removes the reject set as a unit
#[derive(Clone)]
pub struct LeakGuard {
    routes: Arc<dyn RouteManager>,
}

impl LeakGuard {
    pub fn new(routes: Arc<dyn RouteManager>) -> Self {
        Self { routes }
    }

    /// Add all four reject routes, or none
    pub fn install(&self) -> Result<(), PlatformError> {
        for (i, net) in REJECT_NETS.iter().enumerate() {
            if let Err(e) = self.routes.route_add(*net, REJECT_MASK, RouteTarget::Reject) {
                warn!("Reject route {} failed, rolling back: {}", net, e);
                for added in &REJECT_NETS[..i] {
                    let removed = self.routes.route_del(*added, REJECT_MASK, RouteTarget::Reject);
                    if let Err(e) = removed {
                        warn!("Rollback of {} failed: {}", added, e);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Delete all four reject routes; absent routes are fine
    pub fn remove(&self) -> Result<(), PlatformError> {
        let mut first_error = None;
        for net in REJECT_NETS {
            if let Err(e) = self.routes.route_del(net, REJECT_MASK, RouteTarget::Reject) {
                warn!("Removing reject route {} failed: {}", net, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Delete the default route and then the reject set
    ///
    /// Used once the tunnel is up (its routes take over) and when an attempt
    /// is abandoned for good.
    pub fn remove_block_and_gateway(&self) {
        debug!("Removing blocking routes");
        // Twice: duplicated default routes have been seen
        for _ in 0..2 {
            if let Err(e) = self.routes.delete_default_gateway() {
                warn!("Deleting default gateway failed: {}", e);
            }
        }
        let _ = self.remove();
    }

    /// Undo everything route related; for user initiated disconnects
    pub fn cleanup(&self, bypass: Option<Ipv4Addr>) {
        if let Some(addr) = bypass {
            if let Err(e) = self.routes.route_del(addr, HOST_MASK, RouteTarget::Default) {
                warn!("Removing route to {} failed: {}", addr, e);
            }
        }
        let _ = self.remove();
        if let Err(e) = self.routes.restore_default_gateway() {
            warn!("Restoring default gateway failed: {}", e);
        }
        debug!("Unblocking IPv6");
        if let Err(e) = self.routes.unblock_ipv6() {
            warn!("Unblocking IPv6 routes failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TableRoutes {
        table: Mutex<HashSet<(Ipv4Addr, Ipv4Addr, RouteTarget)>>,
        fail_on: Option<Ipv4Addr>,
        gateway_deletes: Mutex<u32>,
    }

    impl RouteManager for TableRoutes {
        fn route_add(
            &self,
            net: Ipv4Addr,
            mask: Ipv4Addr,
            target: RouteTarget,
        ) -> Result<(), PlatformError> {
            if self.fail_on == Some(net) {
                return Err(PlatformError::AddRouteError("Network is unreachable".to_string()));
            }
            self.table.lock().unwrap().insert((net, mask, target));
            Ok(())
        }

        fn route_del(
            &self,
            net: Ipv4Addr,
            mask: Ipv4Addr,
            target: RouteTarget,
        ) -> Result<(), PlatformError> {
            self.table.lock().unwrap().remove(&(net, mask, target));
            Ok(())
        }

        fn default_gateway(&self) -> Result<Option<Ipv4Addr>, PlatformError> {
            Ok(None)
        }

        fn delete_default_gateway(&self) -> Result<(), PlatformError> {
            *self.gateway_deletes.lock().unwrap() += 1;
            Ok(())
        }

        fn restore_default_gateway(&self) -> Result<(), PlatformError> {
            Ok(())
        }

        fn restore_saved_default_gateway(&self) -> Result<(), PlatformError> {
            Ok(())
        }

        fn block_ipv6(&self) -> Result<(), PlatformError> {
            Ok(())
        }

        fn unblock_ipv6(&self) -> Result<(), PlatformError> {
            Ok(())
        }
    }

    #[test]
    fn test_reject_nets_cover_ipv4() {
        let mask = u32::from(REJECT_MASK);
        let mut covered: Vec<u32> = REJECT_NETS.iter().map(|n| u32::from(*n) & mask).collect();
        covered.dedup();
        assert_eq!(covered.len(), 4);
        assert_eq!(mask.count_ones(), 2);
        for net in REJECT_NETS {
            assert_eq!(u32::from(net) & !mask, 0);
        }
    }

    #[test]
    fn test_install_is_set_idempotent() {
        let routes = Arc::new(TableRoutes::default());
        let guard = LeakGuard::new(routes.clone());
        guard.install().unwrap();
        let once = routes.table.lock().unwrap().clone();
        guard.install().unwrap();
        assert_eq!(*routes.table.lock().unwrap(), once);
        assert_eq!(once.len(), 4);

        guard.remove().unwrap();
        assert!(routes.table.lock().unwrap().is_empty());
        guard.remove().unwrap();
    }

    #[test]
    fn test_partial_install_rolls_back() {
        let routes = Arc::new(TableRoutes {
            fail_on: Some(Ipv4Addr::new(128, 0, 0, 0)),
            ..TableRoutes::default()
        });
        let guard = LeakGuard::new(routes.clone());
        assert!(guard.install().is_err());
        assert!(routes.table.lock().unwrap().is_empty());
    }

    #[test]
    fn test_remove_block_and_gateway() {
        let routes = Arc::new(TableRoutes::default());
        let guard = LeakGuard::new(routes.clone());
        guard.install().unwrap();
        guard.remove_block_and_gateway();
        assert!(routes.table.lock().unwrap().is_empty());
        assert_eq!(*routes.gateway_deletes.lock().unwrap(), 2);
    }
}
