use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use snmp::{SyncSession, Value};

use super::{QueryClient, QueryError};

/// Default SNMP agent port.
pub const SNMP_PORT: u16 = 161;

/// SNMPv2c GET client.
///
/// Each request opens its own UDP session on tokio's blocking pool, so a slow
/// agent only delays the worker that asked.
pub struct SnmpClient {
    timeout: Duration,
    next_request_id: AtomicI32,
}

impl SnmpClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            next_request_id: AtomicI32::new(1),
        }
    }

    fn request_id(&self) -> i32 {
        // Wraps back to a positive value instead of going negative.
        self.next_request_id.fetch_add(1, Ordering::Relaxed) & i32::MAX
    }
}

impl QueryClient for SnmpClient {
    fn get(
        &self,
        address: &str,
        community: &str,
        oid: &str,
    ) -> impl Future<Output = Result<i128, QueryError>> + Send {
        let agent = agent_address(address);
        let community = community.as_bytes().to_vec();
        let oid = parse_oid(oid);
        let timeout = self.timeout;
        let req_id = self.request_id();

        async move {
            let oid = oid?;
            tokio::task::spawn_blocking(move || blocking_get(&agent, &community, &oid, timeout, req_id))
                .await
                .map_err(|e| QueryError::Task(e.to_string()))?
        }
    }
}

fn blocking_get(
    agent: &str,
    community: &[u8],
    oid: &[u32],
    timeout: Duration,
    req_id: i32,
) -> Result<i128, QueryError> {
    let mut session = SyncSession::new(agent, community, Some(timeout), req_id).map_err(
        |source| QueryError::Session {
            address: agent.to_string(),
            source,
        },
    )?;

    let mut pdu = session.get(oid).map_err(|e| QueryError::Request {
        address: agent.to_string(),
        reason: format!("{e:?}"),
    })?;

    if pdu.error_status != 0 {
        return Err(QueryError::ErrorStatus {
            address: agent.to_string(),
            status: pdu.error_status,
        });
    }

    match pdu.varbinds.next() {
        Some((_, value)) => sample_value(value),
        None => Err(QueryError::NoValue),
    }
}

/// Converts a varbind value to the integer sample type.
fn sample_value(value: Value<'_>) -> Result<i128, QueryError> {
    match value {
        Value::Integer(v) => Ok(i128::from(v)),
        Value::Counter32(v) | Value::Unsigned32(v) | Value::Timeticks(v) => Ok(i128::from(v)),
        Value::Counter64(v) => Ok(i128::from(v)),
        other => Err(QueryError::UnsupportedValue(format!("{other:?}"))),
    }
}

/// Parses dotted OID text such as `1.3.6.1.2.1.1.3.0` or `.1.3.6.1`.
pub fn parse_oid(text: &str) -> Result<Vec<u32>, QueryError> {
    let trimmed = text.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        return Err(QueryError::InvalidOid(text.to_string()));
    }

    let arcs = trimmed
        .split('.')
        .map(str::parse::<u32>)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| QueryError::InvalidOid(text.to_string()))?;

    if arcs.len() < 2 {
        return Err(QueryError::InvalidOid(text.to_string()));
    }

    Ok(arcs)
}

/// Appends the default SNMP port unless `address` already carries one.
pub fn agent_address(address: &str) -> String {
    if address.parse::<SocketAddr>().is_ok() {
        return address.to_string();
    }

    match address.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, SNMP_PORT).to_string(),
        Err(_) if address.contains(':') => address.to_string(),
        Err(_) => format!("{address}:{SNMP_PORT}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_oid() {
        assert_eq!(
            parse_oid("1.3.6.1.2.1.2.2.1.10.1").expect("valid"),
            vec![1, 3, 6, 1, 2, 1, 2, 2, 1, 10, 1]
        );
        assert_eq!(parse_oid(".1.3.6.1").expect("valid"), vec![1, 3, 6, 1]);
    }

    #[test]
    fn test_parse_oid_rejects_garbage() {
        assert!(parse_oid("").is_err());
        assert!(parse_oid("X").is_err());
        assert!(parse_oid("1").is_err());
        assert!(parse_oid("1.3..6").is_err());
        assert!(parse_oid("1.3.-6").is_err());
    }

    #[test]
    fn test_agent_address() {
        assert_eq!(agent_address("10.0.0.1"), "10.0.0.1:161");
        assert_eq!(agent_address("10.0.0.1:1161"), "10.0.0.1:1161");
        assert_eq!(agent_address("::1"), "[::1]:161");
        assert_eq!(agent_address("[::1]:1161"), "[::1]:1161");
        assert_eq!(agent_address("router.lan"), "router.lan:161");
        assert_eq!(agent_address("router.lan:1161"), "router.lan:1161");
    }

    #[test]
    fn test_value_conversion() {
        assert_eq!(sample_value(Value::Integer(-5)).expect("int"), -5);
        assert_eq!(sample_value(Value::Counter32(42)).expect("c32"), 42);
        assert_eq!(
            sample_value(Value::Counter64(1 << 40)).expect("c64"),
            1 << 40
        );
        assert_eq!(sample_value(Value::Timeticks(7)).expect("ticks"), 7);
    }

    #[test]
    fn test_counter64_above_i64_is_a_sample() {
        assert_eq!(
            sample_value(Value::Counter64(u64::MAX)).expect("c64"),
            i128::from(u64::MAX)
        );
    }

    #[test]
    fn test_octet_string_is_unsupported() {
        assert!(matches!(
            sample_value(Value::OctetString(&b"up"[..])),
            Err(QueryError::UnsupportedValue(_))
        ));
    }

    #[test]
    fn test_request_ids_stay_positive() {
        let client = SnmpClient::new(Duration::from_secs(1));
        client.next_request_id.store(i32::MAX, Ordering::Relaxed);
        assert_eq!(client.request_id(), i32::MAX);
        assert!(client.request_id() >= 0);
    }

    #[tokio::test]
    async fn test_invalid_oid_fails_before_network() {
        let client = SnmpClient::new(Duration::from_millis(10));
        let err = client
            .get("127.0.0.1", "public", "not-an-oid")
            .await
            .expect_err("should fail");
        assert!(matches!(err, QueryError::InvalidOid(_)));
    }
}
