pub mod capability;
pub mod compensation;
pub mod device;
pub mod preferences;
pub mod price;
pub mod session;
pub mod stats;

pub use capability::*;
pub use compensation::*;
pub use device::*;
pub use preferences::*;
pub use price::*;
pub use session::*;
pub use stats::*;
