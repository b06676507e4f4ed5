//! Transfer engine
//!
//! Key types:
//! - `TransferDescriptor` - Progress and state of one upload or download
//! - `TransferOrchestrator` - Bounded worker pool with retry and cancellation
//! - `TransferHandle` - Requester's view of a transfer
//! - `RetryPolicy` / `Throttle` - Backoff curve and global bandwidth limit

mod executor;
mod orchestrator;
mod retry;
mod throttle;
mod types;

pub use executor::TransferEvent;
pub use orchestrator::{TransferHandle, TransferOrchestrator};
pub use retry::RetryPolicy;
pub use throttle::Throttle;
pub use types::{
    Priority, TransferDescriptor, TransferDirection, TransferFailure, TransferId,
    TransferRequest, TransferState,
};
