pub mod args;
pub mod card;
pub mod clock;
pub mod command;
pub mod completion;
mod dispatch;
pub mod error;
pub mod host;
pub mod platform;
pub mod poll;
pub mod regs;
pub mod reset;
pub mod response;
pub mod sim;
mod transfer;
pub mod volume;

// Re-export commonly used types
pub use args::Args;
pub use card::{BlockStream, CardInfo, SdCard};
pub use command::{Command, CommandClass, ResponseType, TransferDirection, TransferInfo};
pub use error::{ErrorKind, Result, SdhcError};
pub use host::{BusWidth, Capabilities, HostConfig, SdHost, SdhcProtocol};
pub use platform::{Platform, StdPlatform};
pub use poll::{PollPolicy, Stall};
pub use regs::{MmioWindow, RegisterWindow};
pub use reset::ResetScope;
pub use response::Response;
pub use sim::SimulatedSdHost;
