//! Trigger handling: auth, dual-mode dispatch and the outer pipeline.
//!
//! The same binary plays both roles. Outside a sandbox it provisions one and
//! hands the request over; inside it runs the job and stops the sandbox.
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │ EntrypointApi (any method, any path)             │
//! │   └─ Dispatcher                                  │
//! │        ├─ AuthGate          Bearer <CRON_SECRET> │
//! │        ├─ OUTER                                  │
//! │        │    Provisioner ──▶ create sandbox       │
//! │        │    BootstrapSequencer ──▶ install/build │
//! │        │                        start (detached) │
//! │        │    ReadinessPoller ──▶ probe ≤ N times  │
//! │        │    RequestForwarder ──▶ replay request  │
//! │        └─ INNER                                  │
//! │             Job (background) ──▶ teardown self   │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod auth;
pub mod bootstrap;
pub mod dispatcher;
pub mod forwarder;
pub mod provisioner;
pub mod readiness;
pub mod trigger;

pub use api::EntrypointApi;
pub use auth::{AuthDecision, AuthGate};
pub use bootstrap::{BootstrapPlan, BootstrapSequencer, BootstrapStep};
pub use dispatcher::{DispatchOutcome, DispatchState, Dispatcher, ExecutionContext};
pub use forwarder::{ForwardedResponse, RequestForwarder};
pub use provisioner::Provisioner;
pub use readiness::{ProbeKind, ReadinessPoller, ReadinessPolicy};
pub use trigger::TriggerRequest;
