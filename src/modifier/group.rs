//! Ordered composition of modifiers

use std::sync::Arc;

use super::{Context, HttpRequest, HttpResponse, Modifier, ModifierError};

/// Runs its members in insertion order for requests and in reverse order
/// for responses, stopping at the first failure.
///
/// With `aggregate_errors` every member runs and all failures are reported
/// together.
#[derive(Default)]
pub struct Group {
    modifiers: Vec<Arc<dyn Modifier>>,
    aggregate_errors: bool,
}

impl Group {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_aggregate_errors(mut self, aggregate: bool) -> Self {
        self.aggregate_errors = aggregate;
        self
    }

    pub fn add(&mut self, modifier: Arc<dyn Modifier>) {
        self.modifiers.push(modifier);
    }

    pub fn with(mut self, modifier: Arc<dyn Modifier>) -> Self {
        self.add(modifier);
        self
    }

    pub fn len(&self) -> usize {
        self.modifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modifiers.is_empty()
    }

    fn run<'a, I, F>(&self, members: I, mut f: F) -> Result<(), ModifierError>
    where
        I: Iterator<Item = &'a Arc<dyn Modifier>>,
        F: FnMut(&dyn Modifier) -> Result<(), ModifierError>,
    {
        if !self.aggregate_errors {
            for m in members {
                f(m.as_ref())?;
            }
            return Ok(());
        }

        let mut errors = Vec::new();
        for m in members {
            if let Err(e) = f(m.as_ref()) {
                errors.push(e);
            }
        }
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ModifierError::Multiple(errors)),
        }
    }
}

impl Modifier for Group {
    fn modify_request(&self, ctx: &mut Context, req: &mut HttpRequest) -> Result<(), ModifierError> {
        self.run(self.modifiers.iter(), |m| m.modify_request(ctx, req))
    }

    fn modify_response(
        &self,
        ctx: &mut Context,
        res: &mut HttpResponse,
    ) -> Result<(), ModifierError> {
        self.run(self.modifiers.iter().rev(), |m| m.modify_response(ctx, res))
    }

    fn verification_errors(&self) -> Vec<String> {
        self.modifiers
            .iter()
            .flat_map(|m| m.verification_errors())
            .collect()
    }

    fn reset_verifications(&self) {
        for m in &self.modifiers {
            m.reset_verifications();
        }
    }
}
