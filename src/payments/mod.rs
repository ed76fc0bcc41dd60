//! Payment settlement
//!
//! Flow: [`gateway::GatewayUrlBuilder`] signs the redirect and records a
//! pending attempt, [`verifier::CallbackVerifier`] classifies what the
//! gateway sends back, and [`settlement::SettlementCoordinator`] applies the
//! outcome to the payment record and the order. Cash-on-delivery goes
//! straight to the coordinator.

pub mod error;
pub mod gateway;
pub mod order;
pub mod settlement;
pub mod signer;
pub mod types;
pub mod verifier;

pub use error::{PaymentError, PaymentResult};
pub use gateway::{GatewayRedirect, GatewayUrlBuilder, PaymentUrlRequest};
pub use order::{InMemoryOrderDirectory, OrderCollaborator, PgOrderDirectory};
pub use settlement::{CodConfirmation, SettlementCoordinator, SettlementOutcome};
pub use signer::{canonicalize, SignableParams, Signer};
pub use types::*;
pub use verifier::{CallbackParams, CallbackVerifier, ForgeryReason, Verification};
