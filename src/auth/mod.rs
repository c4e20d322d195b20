//! Wallet sign-in orchestration and session persistence.

pub mod flow;
pub mod session;

pub use self::flow::{AuthFlowConfig, AuthFlowController, AuthPhase, SessionEvent, StepTimeouts};
pub use self::session::{AuthSession, SESSION_STORAGE_KEY, SessionStore};
pub use crate::remote::AccountMode;
