//! Coordination engine.
//!
//! [`Coordinator`] owns the store, the event bus, and the in-process
//! registries, and implements every tool operation: entity CRUD with its
//! invariants, the checkpoint subsystem, derived streams, the bounded
//! iteration loop, the quality-gate runner, and the preflight probe.

pub mod checkpoints;
pub mod entity;
pub mod gates;
pub mod iteration;
pub mod preflight;
pub mod runner;
pub mod streams;
pub mod task_tools;

use std::path::PathBuf;
use std::sync::Arc;

use coord_core::error::Result;
use coord_core::events::EventBus;
use coord_core::hooks::StopHookRegistry;
use coord_core::models::Task;
use coord_core::security::SecurityRegistry;
use coord_core::validation::ValidatorRegistry;
use database::CoordStore;

use gates::GateRunner;

/// Construction options for [`Coordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Project root the engine operates in (gates, preflight, file paths)
    pub project_root: PathBuf,
    /// Directory archive exports are written to
    pub store_dir: PathBuf,
    /// Create auto-checkpoints on status and iteration transitions
    pub auto_checkpoint: bool,
    /// Evaluate the security hook pipeline
    pub security_enabled: bool,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            store_dir: cwd.join(".coord"),
            project_root: cwd,
            auto_checkpoint: true,
            security_enabled: true,
        }
    }
}

/// The engine behind the tool surface. One instance per workspace process;
/// shared across the stdio loop and the HTTP mirror via `Arc`.
pub struct Coordinator {
    pub(crate) store: Arc<CoordStore>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) security: Arc<SecurityRegistry>,
    pub(crate) stop_hooks: Arc<StopHookRegistry>,
    pub(crate) validators: ValidatorRegistry,
    pub(crate) gates: GateRunner,
    pub(crate) session_id: String,
    pub(crate) options: CoordinatorOptions,
}

impl Coordinator {
    pub fn new(store: Arc<CoordStore>, options: CoordinatorOptions) -> Self {
        Self {
            store,
            events: Arc::new(EventBus::new()),
            security: Arc::new(SecurityRegistry::new(options.security_enabled)),
            stop_hooks: Arc::new(StopHookRegistry::new()),
            validators: ValidatorRegistry::with_defaults(),
            gates: GateRunner::new(options.project_root.clone()),
            session_id: coord_core::id::new_id("SES"),
            options,
        }
    }

    pub fn store(&self) -> &CoordStore {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn security(&self) -> &SecurityRegistry {
        &self.security
    }

    pub fn stop_hooks(&self) -> &StopHookRegistry {
        &self.stop_hooks
    }

    pub fn gates(&self) -> &GateRunner {
        &self.gates
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Initiative a task belongs to, resolved transitively through its PRD.
    /// Subtasks inherit the parent's PRD through the whole tree. Falls back
    /// to the current initiative for free-floating tasks.
    pub(crate) async fn initiative_for_task(&self, task: &Task) -> Result<String> {
        let mut prd_id = task.prd_id.clone();
        let mut parent_id = task.parent_id.clone();
        // Bounded walk up the subtask tree
        let mut hops = 0;
        while prd_id.is_none() && hops < 32 {
            let Some(id) = parent_id.take() else { break };
            match self.store.get_task(&id).await? {
                Some(parent) => {
                    prd_id = parent.prd_id;
                    parent_id = parent.parent_id;
                }
                None => break,
            }
            hops += 1;
        }
        if let Some(prd_id) = prd_id {
            if let Some(prd) = self.store.get_prd(&prd_id).await? {
                return Ok(prd.initiative_id);
            }
        }
        Ok(self
            .store
            .current_initiative_id()
            .await?
            .unwrap_or_else(|| "unassigned".to_string()))
    }
}
