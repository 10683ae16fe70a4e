pub mod core_identity;
pub mod traits;

pub use core_identity::IdentityCore;
pub use traits::{IdentityStore, IdentityTraits};
