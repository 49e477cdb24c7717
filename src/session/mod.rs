//! Load sessions
//!
//! A [`DocumentLoader`] owns at most one current session. Starting a new one,
//! through [`DocumentLoader::load`] or [`DocumentLoader::retry`], tears the
//! previous session down: its fetch and progress tasks are aborted and its
//! resource handle released.
//!
//! The UI drives the loader through actions and listens on the
//! [`EventReceiver`] returned at construction:
//!
//! | Action                   | Valid from      |
//! |--------------------------|-----------------|
//! | `load(reference)`        | any state       |
//! | `retry()`                | `Failed`        |
//! | `cancel()`               | any state       |
//! | `open_externally()`      | any session     |
//! | `report_render_failure()`| `Ready`         |
//! | `confirm_rendered()`     | `Ready`         |

mod controller;
mod types;

pub use controller::DocumentLoader;
pub use types::{
    EventReceiver, ExternalLink, FailureKind, LoadState, LoaderError, LoaderEvent, SessionId,
    SessionSnapshot,
};
