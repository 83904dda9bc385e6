//! judo: run a command or upload-and-run a script on many hosts over ssh.
//!
//! Every targeted host gets its own tokio task. Script payloads go through
//! `deploy::send_remote_and_run`, which reuses a per-host ssh control
//! connection and always removes its remote temporary directory.

pub mod config;
pub mod deploy;
pub mod error;
pub mod host;
pub mod inventory;
pub mod job;
pub mod log;
pub mod proc;
pub mod script;
pub mod transport;
pub mod util;

pub use error::{Error, Result};
pub use host::Host;
pub use inventory::Inventory;
pub use job::{Job, JobResult, Payload};
pub use log::Logger;
pub use script::{Command, Script};
pub use transport::{SshTransport, Transport};
