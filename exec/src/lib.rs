pub mod command;
pub mod executor;
pub mod fake;
pub mod local;
pub mod machine;

pub use command::{CommandOutput, CommandRequest};
pub use executor::RemoteExecutor;
pub use fake::FakeExecutor;
pub use local::LocalExecutor;
pub use machine::{Machine, MachineRegistry};
