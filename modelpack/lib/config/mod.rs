//! Configuration types and defaults.

mod defaults;
mod pull;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use defaults::*;
pub use pull::*;
