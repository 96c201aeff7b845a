pub mod identity;
pub mod lazy_ref;
pub mod registry;

pub use identity::*;
pub use lazy_ref::*;
pub use registry::*;
