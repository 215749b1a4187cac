pub mod change;
pub mod external;
pub mod playlist;
pub mod snapshot;
pub mod track;

pub use change::*;
pub use external::*;
pub use playlist::*;
pub use snapshot::*;
pub use track::*;
