/**
 * QUEUE STORE - File durable de télémétrie partagée entre processus
 *
 * RÔLE :
 * Source de vérité unique pour les observations non livrées et pour le cache
 * d'inventaire réseau (ip → mac). Les collecteurs y écrivent depuis leurs
 * propres processus, l'uploader y lit et y acquitte.
 *
 * FONCTIONNEMENT :
 * - Un fichier SQLite par agent, une connexion par processus
 * - WAL + busy timeout : les écrivains concurrents sont sérialisés par SQLite
 * - Chaque mutation tourne dans une transaction IMMEDIATE
 * - AUTOINCREMENT : un id n'est jamais réutilisé
 *
 * CONTRAT (livraison at-least-once) :
 * - put → l'entrée existe jusqu'à remove/mark_uploaded explicite
 * - peek → lecture seule, idempotente, ordre d'insertion
 * - fail → l'entrée reste éligible au prochain peek
 */

pub mod hosts;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub use hosts::{HostRecord, HostUpdate};

/// Erreurs de la couche de stockage. Toujours fatales pour l'appelant.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Attente max quand un autre processus tient le verrou d'écriture
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS entries (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    type            TEXT NOT NULL,
    payload         TEXT NOT NULL,
    timestamp       INTEGER NOT NULL,
    status          INTEGER NOT NULL DEFAULT 0,
    failure_reason  TEXT
);
CREATE INDEX IF NOT EXISTS entries_status ON entries (status, id);
CREATE TABLE IF NOT EXISTS hosts (
    ip                TEXT PRIMARY KEY,
    mac_address       TEXT,
    ssh_last_tested   INTEGER,
    snmp_last_tested  INTEGER,
    last_nmap_scan    INTEGER,
    open_ports        TEXT
);
";

/// État de livraison d'une entrée
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Jamais tentée, ou en attente
    Pending,
    /// Livrée et archivée (keep_delivered)
    Uploaded,
    /// Au moins un refus de l'API, reste éligible
    Failed,
}

impl EntryStatus {
    fn code(self) -> i64 {
        match self {
            EntryStatus::Pending => 0,
            EntryStatus::Uploaded => 1,
            EntryStatus::Failed => 2,
        }
    }

    fn from_code(code: i64) -> Self {
        match code {
            1 => EntryStatus::Uploaded,
            2 => EntryStatus::Failed,
            _ => EntryStatus::Pending,
        }
    }
}

/// Une observation en attente de livraison
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEntry {
    pub id: i64,
    /// Collecteur d'origine, utilisé par l'API pour router le payload
    #[serde(rename = "type")]
    pub entry_type: String,
    /// Opaque pour l'agent
    pub payload: serde_json::Value,
    /// Millisecondes epoch, fixé par le collecteur à la capture
    pub timestamp: i64,
    pub status: EntryStatus,
    pub failure_reason: Option<String>,
}

/// Compteurs par état, pour `vigie-agent status` et les logs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub failed: u64,
    pub uploaded: u64,
}

/// File durable + inventaire hôtes, adossés à un fichier SQLite
pub struct QueueStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl QueueStore {
    /// Ouvre (ou crée) la base au chemin donné
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA)?;

        debug!("queue store opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Base en mémoire (tests)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Ajoute une entrée et retourne son id
    pub fn put(
        &self,
        entry_type: &str,
        payload: &serde_json::Value,
        timestamp: i64,
    ) -> Result<i64, StoreError> {
        let payload = serde_json::to_string(payload)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO entries (type, payload, timestamp, status) VALUES (?1, ?2, ?3, ?4)",
            params![entry_type, payload, timestamp, EntryStatus::Pending.code()],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        debug!("queued {} entry {}", entry_type, id);
        Ok(id)
    }

    /// Jusqu'à `limit` entrées non livrées, dans l'ordre d'insertion
    pub fn peek(&self, limit: usize) -> Result<Vec<QueueEntry>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, type, payload, timestamp, status, failure_reason \
             FROM entries WHERE status != ?1 ORDER BY id LIMIT ?2",
        )?;

        let rows = stmt.query_map(
            params![EntryStatus::Uploaded.code(), limit as i64],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            },
        )?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, entry_type, payload, timestamp, status, failure_reason) = row?;
            entries.push(QueueEntry {
                id,
                entry_type,
                payload: serde_json::from_str(&payload)?,
                timestamp,
                status: EntryStatus::from_code(status),
                failure_reason,
            });
        }
        Ok(entries)
    }

    /// Supprime définitivement. Id inconnu ou déjà supprimé : no-op.
    pub fn remove(&self, id: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM entries WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    /// Archive l'entrée au lieu de la supprimer ; elle sort de `peek`
    pub fn mark_uploaded(&self, id: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE entries SET status = ?1 WHERE id = ?2",
            params![EntryStatus::Uploaded.code(), id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Enregistre le motif du refus sans retirer l'entrée
    pub fn fail(&self, id: i64, reason: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE entries SET status = ?1, failure_reason = ?2 WHERE id = ?3 AND status != ?4",
            params![
                EntryStatus::Failed.code(),
                reason,
                id,
                EntryStatus::Uploaded.code()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Vidage administratif (reset opérateur)
    pub fn remove_all(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = tx.execute("DELETE FROM entries", [])?;
        tx.commit()?;

        info!("queue cleared, {} entries removed", removed);
        Ok(removed)
    }

    /// Reset opérateur qui conserve l'historique
    pub fn mark_all_uploaded(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let archived = tx.execute(
            "UPDATE entries SET status = ?1 WHERE status != ?1",
            params![EntryStatus::Uploaded.code()],
        )?;
        tx.commit()?;

        info!("queue archived, {} entries marked uploaded", archived);
        Ok(archived)
    }

    pub fn stats(&self) -> Result<QueueStats, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM entries GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let (status, count) = row?;
            match EntryStatus::from_code(status) {
                EntryStatus::Pending => stats.pending = count as u64,
                EntryStatus::Failed => stats.failed = count as u64,
                EntryStatus::Uploaded => stats.uploaded = count as u64,
            }
        }
        Ok(stats)
    }

    /// Lit une entrée quel que soit son état (diagnostic, tests)
    pub fn get(&self, id: i64) -> Result<Option<QueueEntry>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, type, payload, timestamp, status, failure_reason \
                 FROM entries WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((id, entry_type, payload, timestamp, status, failure_reason)) => {
                Ok(Some(QueueEntry {
                    id,
                    entry_type,
                    payload: serde_json::from_str(&payload)?,
                    timestamp,
                    status: EntryStatus::from_code(status),
                    failure_reason,
                }))
            }
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for QueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(entries: &[QueueEntry]) -> Vec<i64> {
        entries.iter().map(|e| e.id).collect()
    }

    #[test]
    fn test_put_then_peek_keeps_entry_until_removed() {
        let store = QueueStore::open_in_memory().unwrap();
        let id = store.put("my type", &json!({"a": "payload"}), 123456).unwrap();

        for _ in 0..3 {
            let entries = store.peek(10).unwrap();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].id, id);
            assert_eq!(entries[0].entry_type, "my type");
            assert_eq!(entries[0].payload, json!({"a": "payload"}));
            assert_eq!(entries[0].timestamp, 123456);
            assert_eq!(entries[0].status, EntryStatus::Pending);
            assert!(entries[0].failure_reason.is_none());
        }

        store.remove(id).unwrap();
        assert!(store.peek(10).unwrap().is_empty());
    }

    #[test]
    fn test_peek_insertion_order_and_limit() {
        let store = QueueStore::open_in_memory().unwrap();
        let a = store.put("t", &json!(1), 30).unwrap();
        let b = store.put("t", &json!(2), 10).unwrap();
        let c = store.put("t", &json!(3), 20).unwrap();

        assert_eq!(ids(&store.peek(10).unwrap()), vec![a, b, c]);
        assert_eq!(ids(&store.peek(2).unwrap()), vec![a, b]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let store = QueueStore::open_in_memory().unwrap();
        let a = store.put("t", &json!({}), 1).unwrap();
        let b = store.put("t", &json!({}), 2).unwrap();

        store.remove(a).unwrap();
        store.remove(a).unwrap();
        store.remove(9999).unwrap();

        assert_eq!(ids(&store.peek(10).unwrap()), vec![b]);
    }

    #[test]
    fn test_ids_are_never_reused() {
        let store = QueueStore::open_in_memory().unwrap();
        let a = store.put("t", &json!({}), 1).unwrap();
        store.remove(a).unwrap();
        let b = store.put("t", &json!({}), 2).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_fail_does_not_remove() {
        let store = QueueStore::open_in_memory().unwrap();
        let id = store.put("t", &json!({}), 1).unwrap();

        store.fail(id, "because i said so").unwrap();

        let entries = store.peek(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, EntryStatus::Failed);
        assert_eq!(entries[0].failure_reason.as_deref(), Some("because i said so"));
    }

    #[test]
    fn test_mark_uploaded_hides_without_deleting() {
        let store = QueueStore::open_in_memory().unwrap();
        let a = store.put("t", &json!({}), 1).unwrap();
        let b = store.put("t", &json!({}), 2).unwrap();

        store.mark_uploaded(a).unwrap();

        assert_eq!(ids(&store.peek(10).unwrap()), vec![b]);
        let archived = store.get(a).unwrap().unwrap();
        assert_eq!(archived.status, EntryStatus::Uploaded);

        // un refus tardif ne ressuscite pas une entrée archivée
        store.fail(a, "late").unwrap();
        assert_eq!(ids(&store.peek(10).unwrap()), vec![b]);
    }

    #[test]
    fn test_remove_all_and_archive_all() {
        let store = QueueStore::open_in_memory().unwrap();
        store.put("t", &json!({}), 1).unwrap();
        store.put("t", &json!({}), 2).unwrap();

        assert_eq!(store.mark_all_uploaded().unwrap(), 2);
        assert!(store.peek(10).unwrap().is_empty());
        assert_eq!(store.stats().unwrap().uploaded, 2);

        assert_eq!(store.remove_all().unwrap(), 2);
        assert_eq!(store.stats().unwrap(), QueueStats::default());
    }

    #[test]
    fn test_stats_by_status() {
        let store = QueueStore::open_in_memory().unwrap();
        let a = store.put("t", &json!({}), 1).unwrap();
        let b = store.put("t", &json!({}), 2).unwrap();
        store.put("t", &json!({}), 3).unwrap();

        store.fail(a, "nope").unwrap();
        store.mark_uploaded(b).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats, QueueStats { pending: 1, failed: 1, uploaded: 1 });
    }

    #[test]
    fn test_file_store_shared_between_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("queue.db");

        let writer = QueueStore::open(&path).unwrap();
        let reader = QueueStore::open(&path).unwrap();

        let id = writer.put("neighbors", &json!({"hosts": []}), 42).unwrap();
        let entries = reader.peek(10).unwrap();
        assert_eq!(ids(&entries), vec![id]);

        reader.remove(id).unwrap();
        assert!(writer.peek(10).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_writers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        QueueStore::open(&path).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|w| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let store = QueueStore::open(&path).unwrap();
                    for i in 0..25 {
                        store.put("load", &json!({"writer": w, "i": i}), i).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let store = QueueStore::open(&path).unwrap();
        let entries = store.peek(1000).unwrap();
        assert_eq!(entries.len(), 100);
        let mut seen = ids(&entries);
        seen.dedup();
        assert_eq!(seen.len(), 100);
    }
}
