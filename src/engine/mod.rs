pub mod reconciler;
pub mod state_machine;

pub use reconciler::{CredentialStore, PositionStore, Reconciler};
pub use state_machine::{evaluate_position, ReconcilePolicy};
