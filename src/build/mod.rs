//! Build coordination: request in, result out

mod coordinator;
mod request;
mod result;

pub use coordinator::BuildCoordinator;
pub use request::{BuildRequest, CachePreference};
pub use result::BuildResult;
