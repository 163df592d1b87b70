/*!
Test Harness pour l'agent Vigie

Regroupe ce dont un test d'intégration a besoin:
- Répertoire temporaire (base de file, fichier de configuration)
- Stub de l'API d'ingestion
- Fichier de configuration pointant vers les deux
*/

use crate::api_stub::MockIngestApi;
use anyhow::Result;
use std::path::PathBuf;
use tempfile::TempDir;

pub struct TestHarness {
    pub api: MockIngestApi,
    dir: TempDir,
}

impl TestHarness {
    pub async fn start() -> Result<Self> {
        env_logger::try_init().ok(); // Init logging pour tests

        Ok(Self {
            api: MockIngestApi::start().await,
            dir: tempfile::tempdir()?,
        })
    }

    pub fn dir(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// Chemin de la base de file du test
    pub fn db_path(&self) -> PathBuf {
        self.dir.path().join("queue.db")
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.path().join("vigie.toml")
    }

    /// Écrit une configuration minimale (api + queue) suivie de `extra`
    pub fn write_config(&self, extra: &str) -> Result<PathBuf> {
        let config = format!(
            "[api]\nurl = \"{}\"\ntoken = \"{}\"\n\n[queue]\npath = \"{}\"\n\n{}",
            self.api.url(),
            self.api.token(),
            self.db_path().display(),
            extra
        );
        let path = self.config_path();
        std::fs::write(&path, config)?;
        log::info!("[HARNESS] Config written to {}", path.display());
        Ok(path)
    }
}
