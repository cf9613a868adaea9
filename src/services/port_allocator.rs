//! Port Allocator
//!
//! Validates reservation requests and hands them to the `PortRepository`,
//! which applies each batch in a single transaction. The storage unique key on
//! (server_id, port, protocol) is the final word on conflicts.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::domain::{PortBinding, Protocol, ServerPort};
use crate::error::{ManmanError, Result};
use crate::persistence::{PortRepository, PortRequest};

pub const MIN_PORT: u32 = 1;
pub const MAX_PORT: u32 = 65535;

/// Check a raw port number lies in 1..=65535
pub fn validate_port(port: u32) -> Result<u16> {
    if !(MIN_PORT..=MAX_PORT).contains(&port) {
        return Err(ManmanError::InvalidArgument(format!(
            "port {} out of range {}-{}",
            port, MIN_PORT, MAX_PORT
        )));
    }
    // Range checked above
    Ok(port as u16)
}

/// Parse a protocol name (TCP or UDP, case-insensitive)
pub fn validate_protocol(protocol: &str) -> Result<Protocol> {
    protocol
        .parse::<Protocol>()
        .map_err(ManmanError::InvalidArgument)
}

#[derive(Clone)]
pub struct PortAllocator {
    ports: Arc<dyn PortRepository>,
}

impl PortAllocator {
    pub fn new(ports: Arc<dyn PortRepository>) -> Self {
        Self { ports }
    }

    /// Reserve the host side of every binding for `session_id`, all or nothing
    #[instrument(skip(self, bindings), fields(count = bindings.len()))]
    pub async fn allocate_multiple_ports(
        &self,
        server_id: i64,
        bindings: &[PortBinding],
        session_id: i64,
    ) -> Result<Vec<ServerPort>> {
        let mut requests = Vec::with_capacity(bindings.len());
        let mut seen = BTreeSet::new();
        for binding in bindings {
            let port = validate_port(u32::from(binding.host_port))?;
            let request = PortRequest::new(port, binding.protocol);
            if !seen.insert(request) {
                return Err(ManmanError::InvalidArgument(format!(
                    "port {}/{} requested twice",
                    port, binding.protocol
                )));
            }
            requests.push(request);
        }

        if requests.is_empty() {
            debug!("No ports to allocate for session {}", session_id);
            return Ok(Vec::new());
        }

        let allocated = self
            .ports
            .allocate_ports(server_id, &requests, session_id)
            .await?;
        info!(
            "Allocated ports {:?} on server {} for session {}",
            allocated
                .iter()
                .map(|p| format!("{}/{}", p.port, p.protocol))
                .collect::<Vec<_>>(),
            server_id,
            session_id
        );
        Ok(allocated)
    }

    /// Release everything held by the session; no-op when it holds nothing
    #[instrument(skip(self))]
    pub async fn deallocate_ports_by_session_id(&self, session_id: i64) -> Result<u64> {
        let released = self.ports.release_session_ports(session_id).await?;
        if released > 0 {
            info!("Released {} ports held by session {}", released, session_id);
        }
        Ok(released)
    }

    /// Unallocated ports in `start..=end` for one protocol
    pub async fn get_available_ports_in_range(
        &self,
        server_id: i64,
        start: u32,
        end: u32,
        protocol: Protocol,
    ) -> Result<Vec<u16>> {
        let start = validate_port(start)?;
        let end = validate_port(end)?;
        if start > end {
            return Err(ManmanError::InvalidArgument(format!(
                "range start {} is after end {}",
                start, end
            )));
        }

        let taken: BTreeSet<u16> = self
            .ports
            .list_server_ports(server_id)
            .await?
            .into_iter()
            .filter(|p| p.protocol == protocol)
            .map(|p| p.port)
            .collect();

        Ok((start..=end).filter(|p| !taken.contains(p)).collect())
    }

    pub async fn is_port_available(
        &self,
        server_id: i64,
        port: u16,
        protocol: Protocol,
    ) -> Result<bool> {
        let port = validate_port(u32::from(port))?;
        Ok(self.ports.get_port(server_id, port, protocol).await?.is_none())
    }

    pub async fn get_ports_by_session_id(&self, session_id: i64) -> Result<Vec<ServerPort>> {
        self.ports.list_session_ports(session_id).await
    }

    pub async fn list_allocated_ports(&self, server_id: i64) -> Result<Vec<ServerPort>> {
        self.ports.list_server_ports(server_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::persistence::InMemoryStore;

    fn allocator() -> PortAllocator {
        PortAllocator::new(Arc::new(InMemoryStore::new()))
    }

    #[test]
    fn test_validate_port_bounds() {
        assert!(validate_port(0).is_err());
        assert!(validate_port(65536).is_err());
        assert_eq!(validate_port(1).unwrap(), 1);
        assert_eq!(validate_port(65535).unwrap(), 65535);
        assert_eq!(
            validate_protocol("sctp").unwrap_err().code(),
            ErrorCode::InvalidArgument
        );
    }

    #[tokio::test]
    async fn test_rejects_port_zero_and_duplicates() {
        let alloc = allocator();
        let err = alloc
            .allocate_multiple_ports(1, &[PortBinding::new(25565, 0, Protocol::Tcp)], 1)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let err = alloc
            .allocate_multiple_ports(
                1,
                &[PortBinding::tcp(25565), PortBinding::new(25566, 25565, Protocol::Tcp)],
                1,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        assert!(alloc.list_allocated_ports(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conflict_reports_owner() {
        let alloc = allocator();
        alloc
            .allocate_multiple_ports(1, &[PortBinding::tcp(25565)], 7)
            .await
            .unwrap();

        let err = alloc
            .allocate_multiple_ports(1, &[PortBinding::udp(25565), PortBinding::tcp(25565)], 8)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ResourceExhausted);
        match err {
            ManmanError::PortConflict(c) => {
                assert_eq!((c.server_id, c.port, c.protocol), (1, 25565, Protocol::Tcp));
                assert_eq!(c.owner_session_id, Some(7));
            }
            other => panic!("unexpected error: {other}"),
        }
        // The UDP half of the failed batch must not have landed
        assert!(alloc.is_port_available(1, 25565, Protocol::Udp).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_overlapping_allocations_single_winner() {
        let alloc = allocator();
        let mut handles = Vec::new();
        for session_id in 1..=8 {
            let alloc = alloc.clone();
            handles.push(tokio::spawn(async move {
                alloc
                    .allocate_multiple_ports(
                        1,
                        &[PortBinding::tcp(27015), PortBinding::udp(27015 + session_id as u16)],
                        session_id,
                    )
                    .await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(alloc.list_allocated_ports(1).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_available_ports_in_range() {
        let alloc = allocator();
        alloc
            .allocate_multiple_ports(1, &[PortBinding::tcp(7001), PortBinding::udp(7002)], 1)
            .await
            .unwrap();

        assert_eq!(
            alloc
                .get_available_ports_in_range(1, 7000, 7003, Protocol::Tcp)
                .await
                .unwrap(),
            vec![7000, 7002, 7003]
        );
        assert_eq!(
            alloc
                .get_available_ports_in_range(1, 7000, 7003, Protocol::Udp)
                .await
                .unwrap(),
            vec![7000, 7001, 7003]
        );
        assert!(alloc
            .get_available_ports_in_range(1, 7003, 7000, Protocol::Tcp)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_deallocate_is_idempotent() {
        let alloc = allocator();
        assert_eq!(alloc.deallocate_ports_by_session_id(42).await.unwrap(), 0);

        alloc
            .allocate_multiple_ports(1, &[PortBinding::tcp(25565)], 42)
            .await
            .unwrap();
        assert_eq!(alloc.get_ports_by_session_id(42).await.unwrap().len(), 1);
        assert_eq!(alloc.deallocate_ports_by_session_id(42).await.unwrap(), 1);
        assert_eq!(alloc.deallocate_ports_by_session_id(42).await.unwrap(), 0);
        assert!(alloc.is_port_available(1, 25565, Protocol::Tcp).await.unwrap());
    }
}
