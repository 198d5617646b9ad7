pub mod http;
pub mod offline;
pub mod reliable;

pub mod mock;

pub use http::{HttpBackend, HttpEvaluator, HttpReasoner};
pub use mock::{ScriptedEvaluator, ScriptedReasoner};
pub use offline::{EchoReasoner, LexicalEvaluator};
pub use reliable::{Reliable, RetryConfig};
