//! Mock provider gateway: fixture store, call log, curl front end and the
//! fake executables that stand in for remote access inside a sandbox.

pub mod curl;
pub mod fake;
pub mod fixtures;
pub mod gateway;
pub mod log;

pub use fake::{FakeCommand, FakeCommandRegistry, REGISTRY_ENV, REGISTRY_FILE_NAME};
pub use fixtures::{Fixture, FixtureManifest, FixtureStore, ManifestEntry, WriteStatus};
pub use gateway::{ErrorScenario, Gateway, GatewayConfig, Request, Response};
pub use log::{CallLog, LeakReport, LogEntry, StateEvent, StateKind, StateLedger};

/// Name of the multiplexed mock binary.
pub const MOCK_BINARY_NAME: &str = "qa-mock";
