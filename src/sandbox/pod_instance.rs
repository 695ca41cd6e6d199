use async_trait::async_trait;
use log::{debug, info};
use std::sync::Mutex;
use tokio::sync::watch;

use crate::channel::types::Bindings;
use crate::sandbox::scope_table::ScopeTable;

/// Runs one piece of code against an environment and returns the resulting top-level
/// bindings.
#[async_trait]
pub trait Interpreter: Send + Sync {
    async fn run(&self, code: &str, env: Bindings) -> Result<Bindings, String>;
}

/// The execution sandbox living inside a pod.
///
/// Executions are independent except through named scopes: bindings produced under a
/// scope are saved and seed the next execution under the same scope. Names starting
/// with `_` are private to one execution and never saved or returned.
pub struct PodInstance {
    interpreter: Box<dyn Interpreter>,
    scopes: Mutex<ScopeTable>,
    stop_tx: watch::Sender<bool>,
}

impl PodInstance {
    pub fn new(interpreter: Box<dyn Interpreter>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            interpreter,
            scopes: Mutex::new(ScopeTable::new()),
            stop_tx,
        }
    }

    pub async fn execute(
        &self,
        code: &str,
        inputs: Bindings,
        scope: Option<&str>,
    ) -> Result<Bindings, String> {
        let env = {
            let scopes = self.scopes.lock().map_err(|e| e.to_string())?;
            scopes.environment(scope, inputs)
        };
        debug!(
            "Executing {} byte(s) of code with {} binding(s) in scope {:?}",
            code.len(),
            env.len(),
            scope
        );

        let mut produced = self.interpreter.run(code, env).await?;
        produced.retain(|name, _| !name.starts_with('_'));

        if let Some(scope) = scope {
            let mut scopes = self.scopes.lock().map_err(|e| e.to_string())?;
            scopes.save(scope, produced.clone());
        }
        Ok(produced)
    }

    /// Releases the pod's run loop.
    pub fn stop(&self) {
        info!("Pod instance stop requested");
        self.stop_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Resolves once [`PodInstance::stop`] has been called.
    pub async fn stopped(&self) {
        let mut rx = self.stop_tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}
