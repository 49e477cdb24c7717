//! Document retrieval
//!
//! A [`Retriever`] performs one attempt and classifies its failure; the
//! [`RetryPolicy`] decides whether another attempt follows and via which
//! [`RetrievalPath`]. Neither touches session state: the session controller
//! feeds outcomes into the policy and owns the attempt counter.

mod policy;
mod retriever;
mod types;

pub use policy::{RetryDecision, RetryPolicy};
pub use retriever::{HttpRetriever, Retriever};
pub use types::{FetchFailure, FetchRequest, RetrievalPath};

#[cfg(test)]
pub(crate) use retriever::ScriptedRetriever;
