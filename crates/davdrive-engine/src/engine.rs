//! Sync engine: drives one synchronization run
//!
//! A run loads capabilities, performs discovery, hands the item set to the
//! propagator and reports progress through a [`SyncEvent`] channel. Two
//! consecutive runs on an unchanged system perform no remote data
//! operations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{error, info};

use davdrive_core::config::SyncOptions;
use davdrive_core::domain::{Instruction, ItemStatus, SyncItem};
use davdrive_core::ports::{
    IJournal, ILocalFileSystem, IPlaceholderProvider, IRemoteStorage, RemoteError,
};

use crate::discovery::Discovery;
use crate::propagator::Propagator;

/// Coarse classification attached to sync-level errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The run failed but a later run may succeed unchanged.
    Normal,
    /// The run cannot succeed without intervention (credentials, server).
    Fatal,
}

/// Progress events emitted during a run
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The discovery set, after move detection and gating.
    AboutToPropagate(Vec<SyncItem>),
    /// One item reached a terminal status.
    ItemCompleted(SyncItem),
    /// A run-level error.
    SyncError {
        message: String,
        category: ErrorCategory,
    },
    /// The run ended.
    Finished { success: bool },
}

/// Summary of one sync run
#[derive(Debug, Clone)]
pub struct SyncResult {
    pub success: bool,
    /// All items with final statuses, ordered by path.
    pub items: Vec<SyncItem>,
    /// Run-level error, when the run ended before propagation.
    pub error: Option<String>,
}

impl SyncResult {
    fn failed(message: String, items: Vec<SyncItem>) -> Self {
        Self {
            success: false,
            items,
            error: Some(message),
        }
    }
}

/// Orchestrates discovery and propagation for one synchronized folder
pub struct SyncEngine {
    remote: Arc<dyn IRemoteStorage>,
    fs: Arc<dyn ILocalFileSystem>,
    journal: Arc<dyn IJournal>,
    #[allow(dead_code)]
    placeholders: Arc<dyn IPlaceholderProvider>,
    options: SyncOptions,
    abort: Arc<AtomicBool>,
    events: Option<mpsc::UnboundedSender<SyncEvent>>,
}

impl SyncEngine {
    pub fn new(
        remote: Arc<dyn IRemoteStorage>,
        fs: Arc<dyn ILocalFileSystem>,
        journal: Arc<dyn IJournal>,
        placeholders: Arc<dyn IPlaceholderProvider>,
        options: SyncOptions,
    ) -> Self {
        Self {
            remote,
            fs,
            journal,
            placeholders,
            options,
            abort: Arc::new(AtomicBool::new(false)),
            events: None,
        }
    }

    /// Attaches a receiver for progress events.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SyncEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    /// Handle for cooperative cancellation; setting it stops new jobs and
    /// lets in-flight transfers wind down.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn emit_failure(&self, message: &str, category: ErrorCategory) {
        error!(message, "sync run failed");
        self.emit(SyncEvent::SyncError {
            message: message.to_string(),
            category,
        });
        self.emit(SyncEvent::Finished { success: false });
    }

    /// Performs one full sync run.
    #[tracing::instrument(skip(self))]
    pub async fn sync(&self) -> Result<SyncResult> {
        self.abort.store(false, Ordering::Release);
        info!("starting sync run");

        // Step 1: capabilities
        let capabilities = match self.remote.capabilities().await {
            Ok(caps) => caps,
            Err(err) => {
                let category = match err {
                    RemoteError::AuthFailed => ErrorCategory::Fatal,
                    _ => ErrorCategory::Normal,
                };
                let message = format!("failed to load server capabilities: {err}");
                self.emit_failure(&message, category);
                return Ok(SyncResult::failed(message, Vec::new()));
            }
        };

        // Step 2: discovery (selective-sync lists are read inside)
        let discovery = Discovery::new(
            Arc::clone(&self.remote),
            Arc::clone(&self.fs),
            Arc::clone(&self.journal),
            self.options.clone(),
            capabilities.clone(),
        );
        let outcome = discovery.run().await.context("discovery failed")?;

        if let Some(message) = outcome.fatal_error {
            self.emit_failure(&message, ErrorCategory::Fatal);
            return Ok(SyncResult::failed(message, Vec::new()));
        }

        if self.abort.load(Ordering::Acquire) {
            self.emit(SyncEvent::Finished { success: false });
            return Ok(SyncResult::failed("aborted".to_string(), Vec::new()));
        }

        // Step 3: propagation
        let to_propagate: Vec<SyncItem> = outcome
            .items
            .into_iter()
            .filter(|i| i.instruction != Instruction::None)
            .collect();
        self.emit(SyncEvent::AboutToPropagate(to_propagate.clone()));

        let propagator = Arc::new(Propagator::new(
            Arc::clone(&self.remote),
            Arc::clone(&self.fs),
            Arc::clone(&self.journal),
            self.options.clone(),
            capabilities,
            Arc::clone(&self.abort),
        ));
        let report = propagator.run(to_propagate).await.context("propagation failed")?;

        let mut items = report.items.clone();
        items.sort_by(|a, b| a.path.cmp(&b.path));
        for item in &items {
            self.emit(SyncEvent::ItemCompleted(item.clone()));
        }

        let success = report.is_success();
        if !success {
            if let Some(fatal) = items
                .iter()
                .find(|i| i.status == ItemStatus::FatalError)
            {
                self.emit(SyncEvent::SyncError {
                    message: fatal
                        .error_string
                        .clone()
                        .unwrap_or_else(|| "fatal error".to_string()),
                    category: ErrorCategory::Fatal,
                });
            }
        }

        info!(success, items = items.len(), "sync run finished");
        self.emit(SyncEvent::Finished { success });

        Ok(SyncResult {
            success,
            items,
            error: None,
        })
    }
}
