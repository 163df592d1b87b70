/**
 * UPLOADER - Vidange de la file vers l'API de collecte
 *
 * RÔLE :
 * Transforme les entrées en attente en lots, les envoie en une requête
 * authentifiée et réconcilie le résultat élément par élément dans la file.
 *
 * CYCLE :
 * 1. peek(batch_limit) ; file vide → pause idle
 * 2. un enregistrement par entrée, dans l'ordre du peek (réponse positionnelle)
 * 3. envoi → UploadOutcome
 * 4. plan_cycle(lot, outcome) → acquittements + pause
 * 5. application des acquittements (remove / mark_uploaded / fail)
 *
 * GARANTIES :
 * - Seules les entrées du peek qui a ouvert le cycle sont touchées
 * - Erreur transport, 5xx, 429, statut inattendu → lot intact
 * - Une entrée n'est supprimée qu'après un `success: true` explicite
 */

pub mod client;

pub use client::{IngestClient, UploadOutcome, UploadRecord};

use crate::config::{QueueConfig, UploaderConfig};
use crate::queue::{QueueEntry, QueueStore, StoreError};
use crate::supervisor::{StopSignal, Unit};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const REJECTED_WITHOUT_MESSAGE: &str = "rejected without message";

/// Pauses entre cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// File vide, ou rien n'a pu être livré
    pub idle: Duration,
    /// Échec transitoire
    pub backoff: Duration,
}

impl From<&UploaderConfig> for Timing {
    fn from(config: &UploaderConfig) -> Self {
        Self {
            idle: config.idle(),
            backoff: config.backoff(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    Remove(i64),
    Fail(i64, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CyclePlan {
    pub acks: Vec<Ack>,
    pub pause: Duration,
}

/// Décision pure : que faire du lot après une tentative d'envoi
pub fn plan_cycle(batch: &[QueueEntry], outcome: &UploadOutcome, timing: &Timing) -> CyclePlan {
    if batch.is_empty() {
        return CyclePlan {
            acks: Vec::new(),
            pause: timing.idle,
        };
    }

    match outcome {
        UploadOutcome::Delivered(results) => {
            // zip : résultats en trop ignorés, entrées sans résultat intactes
            let acks: Vec<Ack> = batch
                .iter()
                .zip(results)
                .map(|(entry, result)| {
                    if result.success {
                        Ack::Remove(entry.id)
                    } else {
                        let reason = result
                            .message
                            .clone()
                            .filter(|m| !m.trim().is_empty())
                            .unwrap_or_else(|| REJECTED_WITHOUT_MESSAGE.to_string());
                        Ack::Fail(entry.id, reason)
                    }
                })
                .collect();

            // Sans aucune suppression, le même lot reviendrait aussitôt
            let progressed = acks.iter().any(|a| matches!(a, Ack::Remove(_)));
            CyclePlan {
                acks,
                pause: if progressed { Duration::ZERO } else { timing.idle },
            }
        }
        UploadOutcome::Transient(_) => CyclePlan {
            acks: Vec::new(),
            pause: timing.backoff,
        },
        UploadOutcome::RateLimited(wait) => CyclePlan {
            acks: Vec::new(),
            pause: *wait,
        },
        UploadOutcome::Rejected { .. } => CyclePlan {
            acks: Vec::new(),
            pause: timing.idle,
        },
    }
}

/// Bilan d'un cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub batch: usize,
    pub removed: usize,
    pub failed: usize,
    pub pause: Duration,
}

pub struct Uploader {
    store: Arc<QueueStore>,
    client: IngestClient,
    source: String,
    batch_limit: usize,
    /// Archive (mark_uploaded) au lieu de supprimer
    keep_delivered: bool,
    timing: Timing,
}

impl Uploader {
    pub fn new(
        store: Arc<QueueStore>,
        client: IngestClient,
        source: impl Into<String>,
        queue: &QueueConfig,
        uploader: &UploaderConfig,
    ) -> Self {
        Self {
            store,
            client,
            source: source.into(),
            batch_limit: queue.batch_limit,
            keep_delivered: queue.keep_delivered,
            timing: Timing::from(uploader),
        }
    }

    /// Un cycle peek → envoi → réconciliation. Seules les erreurs de stockage remontent.
    pub async fn run_cycle(&self) -> Result<CycleReport, StoreError> {
        let batch = self.store.peek(self.batch_limit)?;
        if batch.is_empty() {
            return Ok(CycleReport {
                batch: 0,
                removed: 0,
                failed: 0,
                pause: self.timing.idle,
            });
        }

        let records: Vec<UploadRecord<'_>> = batch
            .iter()
            .map(|entry| UploadRecord::from_entry(&self.source, entry))
            .collect();
        let outcome = self.client.send(&records).await;
        self.log_outcome(batch.len(), &outcome);

        let plan = plan_cycle(&batch, &outcome, &self.timing);
        let mut report = CycleReport {
            batch: batch.len(),
            removed: 0,
            failed: 0,
            pause: plan.pause,
        };

        for ack in &plan.acks {
            match ack {
                Ack::Remove(id) => {
                    if self.keep_delivered {
                        self.store.mark_uploaded(*id)?;
                    } else {
                        self.store.remove(*id)?;
                    }
                    report.removed += 1;
                }
                Ack::Fail(id, reason) => {
                    debug!("entry {} rejected: {}", id, reason);
                    self.store.fail(*id, reason)?;
                    report.failed += 1;
                }
            }
        }

        if report.removed > 0 || report.failed > 0 {
            info!(
                "uploaded batch of {}: {} delivered, {} rejected",
                report.batch, report.removed, report.failed
            );
        }
        Ok(report)
    }

    fn log_outcome(&self, size: usize, outcome: &UploadOutcome) {
        match outcome {
            UploadOutcome::Delivered(results) if results.len() != size => {
                warn!("collector answered {} results for {} records", results.len(), size)
            }
            UploadOutcome::Delivered(_) => {}
            UploadOutcome::Transient(reason) => {
                warn!("upload failed, retrying in {:?}: {}", self.timing.backoff, reason)
            }
            UploadOutcome::RateLimited(wait) => warn!("rate limited by collector, waiting {:?}", wait),
            UploadOutcome::Rejected { status, body } => {
                let body: String = body.chars().take(200).collect();
                error!("upload rejected with HTTP {}: {}", status, body)
            }
        }
    }
}

/// Boucle de l'uploader sous le superviseur
pub struct UploaderUnit {
    uploader: Uploader,
}

impl UploaderUnit {
    pub fn new(uploader: Uploader) -> Self {
        Self { uploader }
    }
}

impl Unit for UploaderUnit {
    fn name(&self) -> &str {
        "uploader"
    }

    fn run(self: Arc<Self>, stop: StopSignal) -> BoxFuture<'static, anyhow::Result<()>> {
        async move {
            info!("uploader started (source {})", self.uploader.source);
            while !stop.is_stopped() {
                let report = self.uploader.run_cycle().await?;
                if !report.pause.is_zero() && !stop.sleep(report.pause).await {
                    break;
                }
            }
            info!("uploader stopped");
            Ok(())
        }
        .boxed()
    }
}
