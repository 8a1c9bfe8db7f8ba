pub mod harness;

pub use harness::{SinkHarness, SmtpClient};
