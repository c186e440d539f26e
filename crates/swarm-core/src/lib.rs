pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod operation;
pub mod ramp;
pub mod report;
pub mod run;
pub mod scheduler;
pub mod selector;
pub mod threshold;
pub mod transport;
pub mod vu;

pub use config::*;
pub use error::*;
pub use health::*;
pub use metrics::*;
pub use operation::*;
pub use ramp::*;
pub use report::*;
pub use run::*;
pub use scheduler::*;
pub use selector::*;
pub use threshold::*;
pub use transport::*;
pub use vu::*;
