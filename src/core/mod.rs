//! 核心层：错误分类与处置、回合状态、会话监管

pub mod error;
pub mod recovery;
pub mod session_supervisor;
pub mod state;

pub use error::{FaultAction, SessionError};
pub use recovery::ErrorSupervisor;
pub use session_supervisor::SessionSupervisor;
pub use state::{SessionOutcome, TurnState};
