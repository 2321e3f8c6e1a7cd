//! The user-configurable slot of the built-in stack

use serde_json::Value;
use std::sync::{Arc, RwLock};

use super::{Context, Group, HttpRequest, HttpResponse, Modifier, ModifierError, Registry};
use crate::error::{Error, Result};

struct Installed {
    modifier: Arc<dyn Modifier>,
    raw: Value,
}

/// Holds the modifier tree installed through the configuration API.
///
/// Swapping is atomic with respect to exchanges: each exchange pins the tree
/// it saw in its request phase and runs the response phase against the same
/// tree, even if a new one was installed meanwhile.
pub struct InstalledPipeline {
    registry: Registry,
    current: RwLock<Installed>,
}

impl InstalledPipeline {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            current: RwLock::new(Installed {
                modifier: Arc::new(Group::new()),
                raw: Value::Object(Default::default()),
            }),
        }
    }

    /// Parse and install a modifier message. On error the previous tree
    /// stays installed.
    pub fn install(&self, body: &[u8]) -> Result<()> {
        let raw: Value = serde_json::from_slice(body)
            .map_err(|e| Error::pipeline(format!("invalid JSON: {}", e)))?;
        let modifier = self.registry.parse_value(&raw)?;
        let mut current = self
            .current
            .write()
            .map_err(|_| Error::pipeline("installed pipeline lock poisoned"))?;
        *current = Installed { modifier, raw };
        tracing::info!("Installed new modifier pipeline");
        Ok(())
    }

    pub fn current(&self) -> Arc<dyn Modifier> {
        match self.current.read() {
            Ok(c) => c.modifier.clone(),
            Err(poisoned) => poisoned.into_inner().modifier.clone(),
        }
    }

    /// The JSON of the last successful install, `{}` before any
    pub fn raw_json(&self) -> Value {
        match self.current.read() {
            Ok(c) => c.raw.clone(),
            Err(poisoned) => poisoned.into_inner().raw.clone(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Modifier for InstalledPipeline {
    fn modify_request(&self, ctx: &mut Context, req: &mut HttpRequest) -> std::result::Result<(), ModifierError> {
        let modifier = self.current();
        ctx.pin_installed(modifier.clone());
        modifier.modify_request(ctx, req)
    }

    fn modify_response(
        &self,
        ctx: &mut Context,
        res: &mut HttpResponse,
    ) -> std::result::Result<(), ModifierError> {
        let modifier = match ctx.pinned_installed() {
            Some(m) => m.clone(),
            None => self.current(),
        };
        modifier.modify_response(ctx, res)
    }

    fn verification_errors(&self) -> Vec<String> {
        self.current().verification_errors()
    }

    fn reset_verifications(&self) {
        self.current().reset_verifications()
    }
}
