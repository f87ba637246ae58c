//! Core library behind the KARNA companion host.
//!
//! - [`gateway`] correlates generation calls with their asynchronous replies,
//!   enforces deadlines and falls back between backends.
//! - [`backends`] holds the local and cloud transports plus their settings.
//! - [`model_manager`] is what the IPC layer calls; it records outcomes and
//!   conversation history around the gateway.
//! - [`db`] initialises SQLite and stores small JSON blobs.
//! - [`errors`] keeps the error catalogue with human friendly metadata.
//! - [`logging`] writes structured diagnostics to the event log table.

pub mod backends;
pub mod db;
pub mod errors;
pub mod gateway;
pub mod logging;
pub mod model_manager;

pub use backends::{BackendId, GatewayConfig};
pub use errors::{GenerationError, TransportError};
pub use gateway::{GenerateOptions, GeneratedText, PartialText, ProviderGateway};
pub use model_manager::ModelManager;
