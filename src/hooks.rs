//! Process-wide hook table
//!
//! `init_hooks` must run once, from the process entry point, before the
//! first task is created. Later calls are no-ops. `Task::create` refuses to
//! build a task while the table is missing.

use crate::config::FilterPolicy;
use crate::task::RequestContext;
use once_cell::sync::OnceCell;
use tracing::{debug, info};

/// Runs on every fresh per-stream request context before the pipeline
pub type PreConnectionHook = fn(&mut RequestContext, &FilterPolicy);

static HOOKS: OnceCell<HookTable> = OnceCell::new();

pub struct HookTable {
    pre_connection: Vec<(&'static str, PreConnectionHook)>,
}

impl HookTable {
    fn standard() -> Self {
        Self {
            pre_connection: vec![("restrict_connection_filters", restrict_connection_filters)],
        }
    }

    /// Apply every pre-connection hook, in registration order
    pub fn run_pre_connection(&self, context: &mut RequestContext, policy: &FilterPolicy) {
        for (name, hook) in &self.pre_connection {
            debug!(stream_id = context.stream_id(), hook = name, "Running pre-connection hook");
            hook(context, policy);
        }
    }

    pub fn pre_connection_hooks(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.pre_connection.iter().map(|(name, _)| *name)
    }
}

/// Register the standard hooks. Idempotent.
pub fn init_hooks() -> &'static HookTable {
    HOOKS.get_or_init(|| {
        let table = HookTable::standard();
        info!(
            hooks = ?table.pre_connection_hooks().collect::<Vec<_>>(),
            "Task hooks initialized"
        );
        table
    })
}

pub fn hooks() -> Option<&'static HookTable> {
    HOOKS.get()
}

pub fn is_initialized() -> bool {
    HOOKS.get().is_some()
}

/// Keep connection-level filters off the per-stream connection
fn restrict_connection_filters(context: &mut RequestContext, policy: &FilterPolicy) {
    if !policy.restricted {
        return;
    }
    context.restrict_filters(policy.connection_filters.iter().cloned());
}
