//! Modifier pipeline: the composable request/response interceptors
//!
//! A [`Modifier`] sees every request before it is forwarded and every
//! response before it is returned to the client. Modifiers compose through
//! [`Group`] (ordered, mirrored on the response path) and [`Filter`]
//! (conditional delegation), and can be built from JSON through the
//! [`Registry`].

mod builtin;
mod context;
mod filter;
mod group;
mod installed;
pub mod matcher;
mod registry;
pub mod stack;

use bytes::Bytes;

pub use builtin::{
    BodyModifier, HeaderBlacklist, HeaderModifier, HeaderVerifier, LogModifier,
    QueryStringModifier, SkipRoundTrip, StatusModifier, UrlVerifier,
};
pub use context::{Context, RequestHead, Session, Timings};
pub use filter::{
    ApiHostCondition, Condition, Filter, HeaderCondition, MethodCondition, Target, UrlCondition,
};
pub use group::Group;
pub use installed::InstalledPipeline;
pub use registry::{Registry, Scope, Scoped};

/// Requests as seen by modifiers: head plus fully buffered body
pub type HttpRequest = hyper::Request<Bytes>;

/// Responses as seen by modifiers: head plus fully buffered body
pub type HttpResponse = hyper::Response<Bytes>;

/// Failure reported by a modifier; aborts the current phase of the exchange
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModifierError {
    #[error("{0}")]
    Failed(String),

    #[error("request loop detected: {0}")]
    LoopDetected(String),

    #[error("{}", join_errors(.0))]
    Multiple(Vec<ModifierError>),
}

impl ModifierError {
    pub fn failed(msg: impl Into<String>) -> Self {
        ModifierError::Failed(msg.into())
    }
}

fn join_errors(errors: &[ModifierError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// A unit of work applied to requests and responses.
///
/// Both hooks default to no-ops. Implementations must not keep per-exchange
/// state in `self`: one tree serves every connection concurrently, so such
/// state belongs in the [`Context`].
pub trait Modifier: Send + Sync {
    fn modify_request(
        &self,
        _ctx: &mut Context,
        _req: &mut HttpRequest,
    ) -> Result<(), ModifierError> {
        Ok(())
    }

    fn modify_response(
        &self,
        _ctx: &mut Context,
        _res: &mut HttpResponse,
    ) -> Result<(), ModifierError> {
        Ok(())
    }

    /// Failures collected by verifiers in this subtree
    fn verification_errors(&self) -> Vec<String> {
        Vec::new()
    }

    /// Return verifiers in this subtree to their initial state
    fn reset_verifications(&self) {}
}
