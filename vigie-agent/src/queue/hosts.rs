//! Host inventory cache: one record per observed IP address.
//!
//! A MAC change behind a known IP means the physical host may have changed, so
//! every probe result derived from the previous host is dropped in the same
//! transaction as the MAC update.

use super::{QueueStore, StoreError};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use tracing::info;

/// Last known state of one IP address
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostRecord {
    pub ip: String,
    pub mac_address: Option<String>,
    pub ssh_last_tested: Option<i64>,
    pub snmp_last_tested: Option<i64>,
    pub last_nmap_scan: Option<i64>,
    pub open_ports: Option<String>,
}

/// Partial update of a [`HostRecord`]. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostUpdate {
    pub mac_address: Option<Option<String>>,
    pub ssh_last_tested: Option<Option<i64>>,
    pub snmp_last_tested: Option<Option<i64>>,
    pub last_nmap_scan: Option<Option<i64>>,
    pub open_ports: Option<Option<String>>,
}

impl HostUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mac_address(mut self, mac: impl Into<String>) -> Self {
        self.mac_address = Some(Some(mac.into()));
        self
    }

    // No built-in collector records probe results yet
    #[cfg(test)]
    pub fn clear_mac_address(mut self) -> Self {
        self.mac_address = Some(None);
        self
    }

    #[cfg(test)]
    pub fn ssh_last_tested(mut self, ts: i64) -> Self {
        self.ssh_last_tested = Some(Some(ts));
        self
    }

    #[cfg(test)]
    pub fn snmp_last_tested(mut self, ts: i64) -> Self {
        self.snmp_last_tested = Some(Some(ts));
        self
    }

    #[cfg(test)]
    pub fn last_nmap_scan(mut self, ts: i64) -> Self {
        self.last_nmap_scan = Some(Some(ts));
        self
    }

    #[cfg(test)]
    pub fn open_ports(mut self, ports: impl Into<String>) -> Self {
        self.open_ports = Some(Some(ports.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

fn text(value: &Option<String>) -> Value {
    match value {
        Some(s) => Value::Text(s.clone()),
        None => Value::Null,
    }
}

fn integer(value: &Option<i64>) -> Value {
    match value {
        Some(v) => Value::Integer(*v),
        None => Value::Null,
    }
}

impl QueueStore {
    pub fn find_host(&self, ip: &str) -> Result<Option<HostRecord>, StoreError> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT ip, mac_address, ssh_last_tested, snmp_last_tested, last_nmap_scan, open_ports \
                 FROM hosts WHERE ip = ?1",
                params![ip],
                |row| {
                    Ok(HostRecord {
                        ip: row.get(0)?,
                        mac_address: row.get(1)?,
                        ssh_last_tested: row.get(2)?,
                        snmp_last_tested: row.get(3)?,
                        last_nmap_scan: row.get(4)?,
                        open_ports: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Creates the record on first sighting. Returns false if the ip was known.
    pub fn put_host(&self, ip: &str, mac: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO hosts (ip, mac_address) VALUES (?1, ?2)",
            params![ip, mac],
        )?;
        tx.commit()?;
        Ok(inserted == 1)
    }

    /// Applies `update` to a known ip. Returns false if the ip is unknown.
    pub fn update_host(&self, ip: &str, update: &HostUpdate) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<Option<String>> = tx
            .query_row(
                "SELECT mac_address FROM hosts WHERE ip = ?1",
                params![ip],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current_mac) = current else {
            return Ok(false);
        };
        if update.is_empty() {
            return Ok(true);
        }

        let mac_changed = matches!(&update.mac_address, Some(new) if *new != current_mac);

        let mut columns: Vec<&'static str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(mac) = &update.mac_address {
            columns.push("mac_address");
            values.push(text(mac));
        }

        if mac_changed {
            for column in ["ssh_last_tested", "snmp_last_tested", "last_nmap_scan", "open_ports"] {
                columns.push(column);
                values.push(Value::Null);
            }
        } else {
            if let Some(ts) = &update.ssh_last_tested {
                columns.push("ssh_last_tested");
                values.push(integer(ts));
            }
            if let Some(ts) = &update.snmp_last_tested {
                columns.push("snmp_last_tested");
                values.push(integer(ts));
            }
            if let Some(ts) = &update.last_nmap_scan {
                columns.push("last_nmap_scan");
                values.push(integer(ts));
            }
            if let Some(ports) = &update.open_ports {
                columns.push("open_ports");
                values.push(text(ports));
            }
        }

        let assignments: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, column)| format!("{column} = ?{}", i + 1))
            .collect();
        let sql = format!(
            "UPDATE hosts SET {} WHERE ip = ?{}",
            assignments.join(", "),
            columns.len() + 1
        );
        values.push(Value::Text(ip.to_string()));

        tx.execute(&sql, params_from_iter(values))?;
        tx.commit()?;

        if mac_changed {
            info!(
                "host {} changed mac ({} -> {}), probe results reset",
                ip,
                current_mac.as_deref().unwrap_or("none"),
                update
                    .mac_address
                    .as_ref()
                    .and_then(|m| m.as_deref())
                    .unwrap_or("none")
            );
        }
        Ok(true)
    }

    /// Operator deletion; the inventory never expires records on its own
    pub fn remove_host(&self, ip: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = tx.execute("DELETE FROM hosts WHERE ip = ?1", params![ip])?;
        tx.commit()?;
        Ok(removed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_host() {
        let store = QueueStore::open_in_memory().unwrap();
        assert!(store.put_host("1.2.3.4", "mac").unwrap());

        let host = store.find_host("1.2.3.4").unwrap().unwrap();
        assert_eq!(host.ip, "1.2.3.4");
        assert_eq!(host.mac_address.as_deref(), Some("mac"));
        assert!(host.ssh_last_tested.is_none());
    }

    #[test]
    fn test_put_host_already_exists() {
        let store = QueueStore::open_in_memory().unwrap();
        assert!(store.put_host("1.2.3.4", "mac").unwrap());
        assert!(!store.put_host("1.2.3.4", "other").unwrap());

        let host = store.find_host("1.2.3.4").unwrap().unwrap();
        assert_eq!(host.mac_address.as_deref(), Some("mac"));
    }

    #[test]
    fn test_find_host_not_found() {
        let store = QueueStore::open_in_memory().unwrap();
        store.put_host("1.2.3.4", "mac").unwrap();
        assert!(store.find_host("9.9.9.9").unwrap().is_none());
    }

    #[test]
    fn test_mac_change_resets_probe_timestamps() {
        let store = QueueStore::open_in_memory().unwrap();
        store.put_host("10.0.0.5", "aa:bb").unwrap();
        store
            .update_host(
                "10.0.0.5",
                &HostUpdate::new()
                    .ssh_last_tested(100)
                    .snmp_last_tested(200)
                    .last_nmap_scan(300)
                    .open_ports("22,161"),
            )
            .unwrap();

        assert!(store
            .update_host("10.0.0.5", &HostUpdate::new().mac_address("cc:dd"))
            .unwrap());

        let host = store.find_host("10.0.0.5").unwrap().unwrap();
        assert_eq!(host.mac_address.as_deref(), Some("cc:dd"));
        assert!(host.ssh_last_tested.is_none());
        assert!(host.snmp_last_tested.is_none());
        assert!(host.last_nmap_scan.is_none());
        assert!(host.open_ports.is_none());
    }

    #[test]
    fn test_same_mac_keeps_probe_timestamps() {
        let store = QueueStore::open_in_memory().unwrap();
        store.put_host("10.0.0.5", "aa:bb").unwrap();
        store
            .update_host("10.0.0.5", &HostUpdate::new().ssh_last_tested(100))
            .unwrap();

        store
            .update_host(
                "10.0.0.5",
                &HostUpdate::new().mac_address("aa:bb").last_nmap_scan(500),
            )
            .unwrap();

        let host = store.find_host("10.0.0.5").unwrap().unwrap();
        assert_eq!(host.ssh_last_tested, Some(100));
        assert_eq!(host.last_nmap_scan, Some(500));
    }

    #[test]
    fn test_clear_mac_counts_as_change() {
        let store = QueueStore::open_in_memory().unwrap();
        store.put_host("1.2.3.4", "mac").unwrap();
        store
            .update_host("1.2.3.4", &HostUpdate::new().ssh_last_tested(123456789))
            .unwrap();

        store
            .update_host("1.2.3.4", &HostUpdate::new().clear_mac_address())
            .unwrap();

        let host = store.find_host("1.2.3.4").unwrap().unwrap();
        assert!(host.mac_address.is_none());
        assert!(host.ssh_last_tested.is_none());
    }

    #[test]
    fn test_update_no_changes() {
        let store = QueueStore::open_in_memory().unwrap();
        store.put_host("1.2.3.4", "mac").unwrap();

        assert!(store.update_host("1.2.3.4", &HostUpdate::new()).unwrap());

        let host = store.find_host("1.2.3.4").unwrap().unwrap();
        assert_eq!(host.mac_address.as_deref(), Some("mac"));
        assert!(host.ssh_last_tested.is_none());
    }

    #[test]
    fn test_update_unknown_host() {
        let store = QueueStore::open_in_memory().unwrap();
        assert!(!store
            .update_host("9.9.9.9", &HostUpdate::new().mac_address("x"))
            .unwrap());
        assert!(store.find_host("9.9.9.9").unwrap().is_none());
    }

    #[test]
    fn test_remove_host() {
        let store = QueueStore::open_in_memory().unwrap();
        store.put_host("1.2.3.4", "mac").unwrap();
        assert!(store.remove_host("1.2.3.4").unwrap());
        assert!(!store.remove_host("1.2.3.4").unwrap());
        assert!(store.find_host("1.2.3.4").unwrap().is_none());
    }
}
